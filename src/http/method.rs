//! The set of method tokens offered by the convenience helpers.
//!
//! Incoming request lines are never validated against this set; any token
//! the peer sends is accepted as-is.

use std::fmt;
use std::str::FromStr;

macro_rules! methods {
    ($($variant:ident => $token:literal,)+) => {
        /// HTTP request method.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)+
        }

        impl Method {
            /// Every method in the set, in token order.
            pub const ALL: &'static [Method] = &[$(Method::$variant,)+];

            /// Wire token, e.g. `GET`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Method::$variant => $token,)+
                }
            }
        }

        impl FromStr for Method {
            type Err = UnknownMethod;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($token => Ok(Method::$variant),)+
                    other => Err(UnknownMethod(other.to_string())),
                }
            }
        }
    };
}

methods! {
    Acl => "ACL",
    Bind => "BIND",
    Checkout => "CHECKOUT",
    Connect => "CONNECT",
    Copy => "COPY",
    Delete => "DELETE",
    Get => "GET",
    Head => "HEAD",
    Link => "LINK",
    Lock => "LOCK",
    MSearch => "M-SEARCH",
    Merge => "MERGE",
    MkActivity => "MKACTIVITY",
    MkCalendar => "MKCALENDAR",
    MkCol => "MKCOL",
    Move => "MOVE",
    Notify => "NOTIFY",
    Options => "OPTIONS",
    Patch => "PATCH",
    Post => "POST",
    PropFind => "PROPFIND",
    PropPatch => "PROPPATCH",
    Purge => "PURGE",
    Put => "PUT",
    Query => "QUERY",
    Rebind => "REBIND",
    Report => "REPORT",
    Search => "SEARCH",
    Source => "SOURCE",
    Subscribe => "SUBSCRIBE",
    Trace => "TRACE",
    Unbind => "UNBIND",
    Unlink => "UNLINK",
    Unlock => "UNLOCK",
    Unsubscribe => "UNSUBSCRIBE",
}

/// A token outside the method set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method {0:?}")]
pub struct UnknownMethod(pub String);

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}
