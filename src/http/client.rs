//! Convenience layer over [`ClientRequest`].
//!
//! One helper per method in the method set starts a request with the method
//! preset; [`Client::fetch`] runs a whole exchange and buffers the response.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::agent::Agent;
use crate::http::error::HttpError;
use crate::http::headers::HeaderMap;
use crate::http::incoming::BodyReadable;
use crate::http::method::Method;
use crate::http::request::{ClientRequest, RequestEvent, RequestEvents, RequestOptions};

/// A fully received response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub status_message: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Issues requests through a shared [`Agent`].
#[derive(Debug, Clone)]
pub struct Client {
    agent: Agent,
}

impl Client {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn request(&self, options: RequestOptions) -> Result<(ClientRequest, RequestEvents), HttpError> {
        ClientRequest::new(&self.agent, options)
    }

    /// Send one request and collect the complete response.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> Result<FetchedResponse, HttpError> {
        let options = headers.iter().fold(
            RequestOptions::from_url(url)?.with_method(method),
            |options, (name, value)| options.with_header(*name, *value),
        );
        let (req, mut events) = self.request(options)?;
        match body {
            Some(body) => req.end_with(body)?,
            None => req.end(),
        }

        while let Some(event) = events.recv().await {
            match event {
                RequestEvent::Response(msg) => {
                    let body = msg.read_to_end().await?;
                    return Ok(FetchedResponse {
                        status: msg.status_code().unwrap_or_default(),
                        status_message: msg.status_message().unwrap_or_default().to_string(),
                        headers: msg.headers().clone(),
                        body,
                    });
                }
                RequestEvent::Error(error) => return Err(error),
                RequestEvent::Abort => return Err(HttpError::Aborted),
                RequestEvent::Close => break,
                _ => {}
            }
        }
        Err(HttpError::SocketHangUp)
    }
}

macro_rules! method_helpers {
    ($($name:ident => $method:ident,)+) => {
        impl Client {
            $(
                #[doc = concat!("Start a request to `url` with method [`Method::", stringify!($method), "`].")]
                pub fn $name(&self, url: &str) -> Result<(ClientRequest, RequestEvents), HttpError> {
                    self.request(RequestOptions::from_url(url)?.with_method(Method::$method))
                }
            )+
        }
    };
}

method_helpers! {
    acl => Acl,
    bind => Bind,
    checkout => Checkout,
    connect => Connect,
    copy => Copy,
    delete => Delete,
    get => Get,
    head => Head,
    link => Link,
    lock => Lock,
    m_search => MSearch,
    merge => Merge,
    mkactivity => MkActivity,
    mkcalendar => MkCalendar,
    mkcol => MkCol,
    r#move => Move,
    notify => Notify,
    options => Options,
    patch => Patch,
    post => Post,
    propfind => PropFind,
    proppatch => PropPatch,
    purge => Purge,
    put => Put,
    query => Query,
    rebind => Rebind,
    report => Report,
    search => Search,
    source => Source,
    subscribe => Subscribe,
    trace => Trace,
    unbind => Unbind,
    unlink => Unlink,
    unlock => Unlock,
    unsubscribe => Unsubscribe,
}
