//
// This module contains the main entry point of the library,
// DavHandler.
//
use std::error::Error as StdError;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{self, buf::Buf};
use futures_util::stream::Stream;
use futures_util::FutureExt;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::acl::{AccessPolicy, DavAcl, FullAccess, RootReadOnly};
use crate::auth::{self, CredentialResolver, Passthrough};
use crate::body::{Body, StreamBody};
use crate::cache::CacheDir;
use crate::conditional;
use crate::davpath::DavPath;
use crate::ls::fakels::FakeLs;
use crate::ls::memls::MemLs;
use crate::props::PropertyStore;
use crate::resource::localfs::LocalBackend;
use crate::resource::objstore::ObjectStoreBackend;
use crate::resource::{DavBackend, DavResource};
use crate::store::{ConnectionPool, StoreError};
use crate::util::{dav_method, DavMethod, DavMethodSet};

use crate::errors::DavError;
use crate::ls::*;
use crate::DavResult;

pub(crate) mod handle_copymove;
pub(crate) mod handle_delete;
pub(crate) mod handle_gethead;
use handle_gethead::READ_BUF_SIZE;
pub(crate) mod handle_lock;
pub(crate) mod handle_mkcol;
pub(crate) mod handle_options;
pub(crate) mod handle_props;
pub(crate) mod handle_put;

/// Largest request body accepted by the methods that take an XML body.
const MAX_XML_BODY: usize = 65536;

/// Configuration of the handler.
#[derive(Clone)]
pub struct DavBuilder {
    /// Prefix to be stripped off when handling request.
    prefix: String,
    /// Storage backend.
    fs: FileSystem,
    /// Locksystem backend.
    ls: LockSystem,
    /// Set of allowed methods (Defaults to "all methods")
    allow: DavMethodSet,
    /// Principal is webdav speak for "user", used to give locks an owner.
    principal: Option<String>,
    /// Permissions per path. The default depends on the backend.
    access: Option<Arc<dyn AccessPolicy>>,
    /// Maps Basic credentials to object store credentials.
    credentials: Arc<dyn CredentialResolver>,
    /// Let a reverse proxy send the file contents.
    sendfile: Sendfile,
    /// Does GET on a directory return indexes.
    autoindex: bool,
    /// 404 for macOS `._name` files on OPTIONS and PROPFIND.
    hide_appledouble: bool,
    /// Shared property table.
    props: Option<Arc<PropertyStore>>,
    /// read buffer size in bytes
    read_buf_size: usize,
}

/// Storage backend.
#[derive(Clone)]
pub enum FileSystem {
    /// A directory on the local filesystem.
    Local {
        /// Path to the root directory.
        base: PathBuf,
    },
    /// Buckets and keys of an object store, read through a local cache.
    ObjectStore {
        pool: Arc<ConnectionPool>,
        cache: Arc<CacheDir>,
    },
}

impl FileSystem {
    /// Serve a local directory.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        FileSystem::Local { base: path.into() }
    }

    /// Serve an object store. `cache_dir` must not be inside any
    /// exported directory.
    pub fn object_store(pool: Arc<ConnectionPool>, cache_dir: impl Into<PathBuf>) -> Self {
        FileSystem::ObjectStore {
            pool,
            cache: CacheDir::new(cache_dir),
        }
    }

    fn default_access(&self) -> Arc<dyn AccessPolicy> {
        match self {
            FileSystem::Local { .. } => Arc::new(FullAccess),
            FileSystem::ObjectStore { .. } => Arc::new(RootReadOnly),
        }
    }
}

/// Lock table.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockSystem {
    /// Real locks, enforced on every modifying request.
    Mem,
    /// LOCK always succeeds and nothing is enforced.
    #[default]
    Fake,
}

impl LockSystem {
    fn build(self) -> Arc<dyn DavLockSystem> {
        match self {
            LockSystem::Mem => MemLs::new(),
            LockSystem::Fake => FakeLs::new(),
        }
    }
}

/// How GET delivers the contents of a leaf.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub enum Sendfile {
    /// Stream the bytes.
    #[default]
    None,
    /// `X-SendFile: <local path>`, optionally percent-encoded.
    XSendfile { escape: bool },
    /// `X-Accel-Redirect: <prefix>/<local path>`.
    XAccelRedirect { prefix: String },
}

impl DavBuilder {
    /// Create a new configuration builder.
    pub fn new(fs: FileSystem) -> DavBuilder {
        Self {
            prefix: String::new(),
            fs,
            ls: LockSystem::default(),
            allow: DavMethodSet::all(),
            principal: None,
            access: None,
            credentials: Arc::new(Passthrough),
            sendfile: Sendfile::None,
            autoindex: true,
            hide_appledouble: true,
            props: None,
            read_buf_size: READ_BUF_SIZE,
        }
    }

    /// Use the configuration that was built to generate a DavHandler.
    pub fn build(self) -> DavHandler {
        self.into()
    }

    /// Prefix to be stripped off before translating the rest of
    /// the request path to a resource path.
    pub fn strip_prefix(self, prefix: impl Into<String>) -> Self {
        let mut this = self;
        this.prefix = prefix.into();
        this
    }

    /// Set the locksystem to use.
    pub fn locksystem(self, ls: LockSystem) -> Self {
        let mut this = self;
        this.ls = ls;
        this
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(self, allow: DavMethodSet) -> Self {
        let mut this = self;
        this.allow = allow;
        this
    }

    /// Set the name of the "webdav principal". This will be the owner of any created locks.
    pub fn principal(self, principal: impl Into<String>) -> Self {
        let mut this = self;
        this.principal = Some(principal.into());
        this
    }

    /// Permissions per path.
    pub fn access(self, access: Arc<dyn AccessPolicy>) -> Self {
        let mut this = self;
        this.access = Some(access);
        this
    }

    /// How to map Basic credentials to object store credentials.
    pub fn credentials(self, credentials: Arc<dyn CredentialResolver>) -> Self {
        let mut this = self;
        this.credentials = credentials;
        this
    }

    /// Delegate file transfers to a reverse proxy.
    pub fn sendfile(self, sendfile: Sendfile) -> Self {
        let mut this = self;
        this.sendfile = sendfile;
        this
    }

    /// Does a GET on a directory produce a directory index (default true).
    pub fn autoindex(self, autoindex: bool) -> Self {
        let mut this = self;
        this.autoindex = autoindex;
        this
    }

    /// Hide macOS AppleDouble files (default true).
    pub fn hide_appledouble(self, hide: bool) -> Self {
        let mut this = self;
        this.hide_appledouble = hide;
        this
    }

    /// Use a shared property store.
    pub fn properties(self, props: Arc<PropertyStore>) -> Self {
        let mut this = self;
        this.props = Some(props);
        this
    }

    /// Read buffer size in bytes
    pub fn read_buf_size(self, size: usize) -> Self {
        let mut this = self;
        this.read_buf_size = size;
        this
    }
}

/// The webdav handler struct.
///
/// The `builder` and `build` methods are used to instantiate a handler.
///
/// The `handle` and `handle_with` methods are the methods that do the actual work.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) prefix: Arc<String>,
    pub(crate) fs: FileSystem,
    pub(crate) ls: Arc<dyn DavLockSystem>,
    pub(crate) allow: DavMethodSet,
    pub(crate) principal: Option<Arc<String>>,
    pub(crate) access: Arc<dyn AccessPolicy>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    pub(crate) sendfile: Sendfile,
    pub(crate) autoindex: bool,
    pub(crate) hide_appledouble: bool,
    pub(crate) props: Arc<PropertyStore>,
    pub(crate) read_buf_size: usize,
}

impl From<DavBuilder> for DavHandler {
    fn from(cfg: DavBuilder) -> Self {
        let access = cfg.access.unwrap_or_else(|| cfg.fs.default_access());
        Self {
            prefix: Arc::new(cfg.prefix),
            fs: cfg.fs,
            ls: cfg.ls.build(),
            allow: cfg.allow,
            principal: cfg.principal.map(Arc::new),
            access,
            credentials: cfg.credentials,
            sendfile: cfg.sendfile,
            autoindex: cfg.autoindex,
            hide_appledouble: cfg.hide_appledouble,
            props: cfg.props.unwrap_or_else(PropertyStore::in_memory),
            read_buf_size: cfg.read_buf_size,
        }
    }
}

/// Everything one request is handled with: the configuration, plus the
/// backend bound to the credentials of the request.
pub(crate) struct DavServer {
    pub(crate) cfg: DavHandler,
    pub(crate) backend: Box<dyn DavBackend>,
    pub(crate) principal: Option<String>,
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder(fs: FileSystem) -> DavBuilder {
        DavBuilder::new(fs)
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        self.handle_inner(req).await
    }

    /// Handle a webdav request, overriding parts of the config.
    ///
    /// For example, the `principal` can be set for this request.
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let mut this = self.clone();
        if let Some(prefix) = prefix {
            this.prefix = Arc::new(format!(
                "{}/{}",
                this.prefix.strip_suffix('/').unwrap_or(&this.prefix),
                prefix.strip_prefix('/').unwrap_or(&prefix)
            ));
        }
        if let Some(principal) = principal {
            this.principal = Some(Arc::new(principal));
        }
        this.handle_inner(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    /// Used with webserver frameworks that have not
    /// opted to use the `http_body` crate just yet.
    #[doc(hidden)]
    pub async fn handle_stream<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        self.handle_inner(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    #[doc(hidden)]
    pub async fn handle_stream_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        let mut this = self.clone();
        if let Some(prefix) = prefix {
            this.prefix = Arc::new(prefix);
        }
        if let Some(principal) = principal {
            this.principal = Some(Arc::new(principal));
        }
        this.handle_inner(req).await
    }

    // drain request body and return it.
    pub(crate) async fn read_request<ReqBody, ReqData, ReqError>(
        &self,
        body: ReqBody,
        max_size: usize,
    ) -> DavResult<Vec<u8>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut data = Vec::new();
        pin_utils::pin_mut!(body);
        while let Some(res) = body.data().await {
            let mut buf = res.map_err(|_| {
                DavError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "UnexpectedEof",
                ))
            })?;
            while buf.has_remaining() {
                if data.len() + buf.remaining() > max_size {
                    return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
                }
                let b = buf.chunk();
                let l = b.len();
                data.extend_from_slice(b);
                buf.advance(l);
            }
        }
        Ok(data)
    }

    // Pick the backend for this request. Object stores need credentials.
    fn backend<B>(&self, req: &Request<B>) -> DavResult<(Box<dyn DavBackend>, Option<String>)> {
        let principal = self.principal.as_ref().map(|p| p.to_string());
        match &self.fs {
            FileSystem::Local { base } => Ok((Box::new(LocalBackend::new(base.clone())), principal)),
            FileSystem::ObjectStore { pool, cache } => {
                let creds = match auth::request_credentials(req, &*self.credentials) {
                    Some(creds) => creds,
                    None => {
                        debug!("no usable credentials for {}", req.uri());
                        return Err(DavError::Unauthorized);
                    }
                };
                let store = pool.get(&creds).map_err(|e| match e {
                    StoreError::AccessDenied => DavError::Unauthorized,
                    e => DavError::BadGateway(Some(e.to_string())),
                })?;
                let principal = principal.or(Some(creds.access_key));
                let backend = ObjectStoreBackend::new(store, cache.clone());
                Ok((Box::new(backend), principal))
            }
        }
    }

    // internal dispatcher.
    async fn handle_inner<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        // Turn any DavError results into a HTTP error response, and
        // a panic into a 500.
        let result = match AssertUnwindSafe(self.handle2(req)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "internal error".to_string());
                error!("request handler panicked: {msg}");
                Err(DavError::Internal(msg))
            }
        };
        match result {
            Ok(resp) => {
                debug!("== END REQUEST result OK {}", resp.status());
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                error_response(err)
            }
        }
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        // translate HTTP method to Webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        // see if method is allowed.
        if !self.allow.allows(method) {
            debug!(
                "method {} not allowed on request {}",
                req.method(),
                req.uri()
            );
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }

        // make sure the request path is valid.
        let path = DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?;

        let (backend, principal) = self.backend(&req)?;
        let server = DavServer {
            cfg: self.clone(),
            backend,
            principal,
        };

        // PUT is the only handler that reads the body itself. All the
        // other handlers either expected no body, or a pre-read Vec<u8>.
        let (body_strm, body_data) = match method {
            DavMethod::Put => (Some(body), Vec::new()),
            _ => (None, self.read_request(body, MAX_XML_BODY).await?),
        };

        // Not all methods accept a body. MKCOL checks for itself.
        match method {
            DavMethod::Put
            | DavMethod::PropFind
            | DavMethod::PropPatch
            | DavMethod::Lock
            | DavMethod::MkCol => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(DavError::UnsupportedMediaType);
                }
            }
        }

        debug!("== START REQUEST {:?} {}", method, path);

        match (method, body_strm) {
            (DavMethod::Options, _) => server.handle_options(&req, &path).await,
            (DavMethod::PropFind, _) => server.handle_propfind(&req, &path, &body_data).await,
            (DavMethod::PropPatch, _) => server.handle_proppatch(&req, &path, &body_data).await,
            (DavMethod::MkCol, _) => server.handle_mkcol(&req, &path, &body_data).await,
            (DavMethod::Delete, _) => server.handle_delete(&req, &path).await,
            (DavMethod::Lock, _) => server.handle_lock(&req, &path, &body_data).await,
            (DavMethod::Unlock, _) => server.handle_unlock(&req, &path).await,
            (DavMethod::Head | DavMethod::Get, _) => server.handle_get(&req, &path, method).await,
            (DavMethod::Copy | DavMethod::Move, _) => {
                server.handle_copymove(&req, &path, method).await
            }
            (DavMethod::Put, Some(body)) => server.handle_put(&req, &path, body).await,
            (DavMethod::Put, None) => Err(DavError::Internal("missing request body".into())),
        }
    }
}

/// A header value from a string that may contain anything.
pub(crate) fn header_value(s: &str) -> DavResult<HeaderValue> {
    HeaderValue::from_str(s).map_err(|_| DavError::Internal(format!("invalid header value {s:?}")))
}

/// Build the reply for a failed request.
pub(crate) fn error_response(err: DavError) -> Response<Body> {
    if let DavError::Unauthorized = err {
        return auth::unauthorized();
    }
    let status = err.statuscode();
    let mut builder = Response::builder().status(status);
    if err.must_close() {
        builder = builder.header("connection", "close");
    }
    let body = match err.message() {
        Some(msg) if status != StatusCode::NOT_MODIFIED => {
            builder = builder
                .header("content-type", "text/plain; charset=utf-8")
                .header("content-length", msg.len().to_string());
            Body::from(msg)
        }
        _ => {
            builder = builder.header("content-length", "0");
            Body::empty()
        }
    };
    builder.body(body).unwrap_or_else(|_| {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}

impl DavServer {
    pub(crate) async fn resolve(&self, path: &DavPath) -> DavResult<Box<dyn DavResource>> {
        Ok(self.backend.resolve(path).await?)
    }

    // helper.
    pub(crate) async fn has_parent(&self, path: &DavPath) -> DavResult<bool> {
        if path.is_root() {
            return Ok(false);
        }
        Ok(self.resolve(&path.parent()).await?.is_collection())
    }

    /// Fail with 403 unless the policy grants `acl` on `path`.
    pub(crate) fn require(&self, path: &DavPath, acl: DavAcl) -> DavResult<()> {
        if self.cfg.access.access(path).contains(acl) {
            Ok(())
        } else {
            debug!("{path}: {acl:?} denied");
            Err(DavError::Forbidden(None))
        }
    }

    /// Fail with 423 if `path` (and with `deep`, anything below it) is
    /// locked by a lock whose token was not submitted.
    pub(crate) fn check_locks(
        &self,
        req: &Request<()>,
        path: &DavPath,
        deep: bool,
    ) -> DavResult<()> {
        let tokens = conditional::if_state_tokens(req.headers())?;
        match self.cfg.ls.check(path, deep, &tokens) {
            Ok(()) => Ok(()),
            Err(lock) => {
                debug!("{path} is locked by {}", lock.token);
                Err(DavError::Status(StatusCode::LOCKED))
            }
        }
    }

    pub(crate) fn is_appledouble(&self, path: &DavPath) -> bool {
        self.cfg.hide_appledouble && path.file_name().starts_with("._")
    }
}
