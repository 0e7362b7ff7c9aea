//! Mapping of HTTP Basic credentials to object store credentials.
//!
//! User accounts live outside this crate. A [`CredentialResolver`] gets
//! the username and password the client sent and returns the access key
//! and secret to talk to the store with, or nothing, in which case the
//! client gets a `401 Unauthorized`.
use std::collections::HashMap;
use std::fmt;

use headers::authorization::Basic;
use headers::{Authorization, HeaderMapExt};
use http::{Request, Response, StatusCode};

use crate::body::Body;

/// Realm sent in the `WWW-Authenticate` header.
pub const REALM: &str = "WebDAV";

/// Object store credentials.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub access_key: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret: impl Into<String>) -> Credentials {
        Credentials {
            access_key: access_key.into(),
            secret: secret.into(),
        }
    }
}

// never log the secret.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

/// Resolves the username / password of a request to store credentials.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, username: &str, password: &str) -> Option<Credentials>;
}

/// Use the username as access key and the password as secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl CredentialResolver for Passthrough {
    fn resolve(&self, username: &str, password: &str) -> Option<Credentials> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Credentials::new(username, password))
    }
}

/// A fixed table of local accounts, each mapped to store credentials.
///
/// Unknown users fall through to [`Passthrough`] behaviour when
/// `passthrough` is set, so that clients can also log in with raw keys.
#[derive(Debug, Default)]
pub struct AccountTable {
    accounts: HashMap<String, (String, Credentials)>,
    passthrough: bool,
}

impl AccountTable {
    pub fn new(passthrough: bool) -> AccountTable {
        AccountTable {
            accounts: HashMap::new(),
            passthrough,
        }
    }

    pub fn add(mut self, user: &str, password: &str, creds: Credentials) -> Self {
        self.accounts
            .insert(user.to_string(), (password.to_string(), creds));
        self
    }
}

impl CredentialResolver for AccountTable {
    fn resolve(&self, username: &str, password: &str) -> Option<Credentials> {
        match self.accounts.get(username) {
            Some((pw, creds)) if pw == password => Some(creds.clone()),
            Some(_) => None,
            None if self.passthrough => Passthrough.resolve(username, password),
            None => None,
        }
    }
}

impl<F> CredentialResolver for F
where
    F: Fn(&str, &str) -> Option<Credentials> + Send + Sync,
{
    fn resolve(&self, username: &str, password: &str) -> Option<Credentials> {
        self(username, password)
    }
}

/// Extract the Basic credentials of a request and resolve them.
pub(crate) fn request_credentials<B>(
    req: &Request<B>,
    resolver: &dyn CredentialResolver,
) -> Option<Credentials> {
    let Authorization(basic) = req.headers().typed_get::<Authorization<Basic>>()?;
    resolver.resolve(basic.username(), basic.password())
}

/// The `401 Unauthorized` reply.
pub(crate) fn unauthorized() -> Response<Body> {
    let mut resp = Response::new(Body::from("please authenticate"));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    let realm = format!("Basic realm=\"{REALM}\"");
    if let Ok(v) = realm.parse() {
        resp.headers_mut().insert("WWW-Authenticate", v);
    }
    resp
}
