//! ## WebDAV for object stores
//!
//! [`Webdav`] (RFC4918) is defined as
//! HTTP (GET/HEAD/PUT/DELETE) plus a bunch of extension methods (PROPFIND, etc).
//! These extension methods are used to manage collections (like unix directories),
//! get information on collections (like unix `ls` or `readdir`), rename and
//! copy items, lock/unlock items, etc.
//!
//! This library is a `handler`: it takes a `http::Request` and produces a
//! `http::Response`. It maps the WebDAV protocol onto an S3-like object
//! store, so that buckets and keys can be mounted as a remote filesystem
//! by Linux, Windows and macOS clients. A plain local directory can be
//! served as well.
//!
//! ## Object store layout.
//!
//! - `/` is a virtual, read-only collection whose members are the buckets.
//! - `/<bucket>` is a collection.
//! - `/<bucket>/<key>` is a leaf if the key exists, and a collection if a
//!   `<key>/` marker exists or if any key lives below `<key>/`.
//!
//! Reads go through a local cache directory: a key is fetched into the
//! cache the first time it is read, and again whenever the object in the
//! store is newer than the cached copy. Writes land in the cache and are
//! then uploaded.
//!
//! Store clients are created per set of credentials, which are taken from
//! the HTTP Basic `Authorization` header of each request (see
//! [`auth::CredentialResolver`]).
//!
//! ## Backend interfaces.
//!
//! - [`store::ObjectStore`]: the operations needed from an object store.
//!   An in-memory store ([`store::memstore::MemStore`]) is included, and
//!   with the `s3` feature a client built on `aws-sdk-s3`.
//! - [`acl::AccessPolicy`]: computes per path what a request may do.
//! - [`props::DeadPropStore`]: storage of client-set properties.
//! - [`ls::DavLockSystem`]: storage of WebDAV locks.
//!
//! ## Example.
//!
//! Serve an in-memory object store on port 4918:
//!
//! ```no_run
//! use std::convert::Infallible;
//! use s3dav::store::{memstore::MemStore, ConnectionPool};
//! use s3dav::{DavHandler, FileSystem, LockSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr = ([127, 0, 0, 1], 4918).into();
//!
//!     let store = MemStore::new();
//!     store.add_bucket("scratch");
//!     let pool = ConnectionPool::single(store);
//!
//!     let dav_server = DavHandler::builder(FileSystem::object_store(pool, "/var/cache/s3dav"))
//!         .locksystem(LockSystem::Mem)
//!         .build();
//!
//!     let make_service = hyper::service::make_service_fn(move |_| {
//!         let dav_server = dav_server.clone();
//!         async move {
//!             let func = move |req| {
//!                 let dav_server = dav_server.clone();
//!                 async move {
//!                     Ok::<_, Infallible>(dav_server.handle(req).await)
//!                 }
//!             };
//!             Ok::<_, Infallible>(hyper::service::service_fn(func))
//!         }
//!     });
//!
//!     let _ = hyper::Server::bind(&addr)
//!         .serve(make_service)
//!         .await
//!         .map_err(|e| eprintln!("server error: {}", e));
//! }
//! ```
//!
//! [`Webdav`]: https://tools.ietf.org/html/rfc4918

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod conditional;
mod davhandler;
mod davheaders;
mod errors;
mod multierror;
mod util;

pub mod acl;
pub mod auth;
pub mod body;
pub mod cache;
pub mod davpath;
pub mod ls;
pub mod props;
pub mod resource;
pub mod store;

#[cfg(any(docsrs, feature = "warp-compat"))]
#[cfg_attr(docsrs, doc(cfg(feature = "warp-compat")))]
pub mod warp;

#[cfg(test)]
mod tests;

use crate::errors::DavResult;

pub use crate::davhandler::{DavBuilder, DavHandler, FileSystem, LockSystem, Sendfile};
pub use crate::errors::{DavError, FsError, FsResult};
pub use crate::util::{DavMethod, DavMethodSet};
