//
//  Sample application.
//
//  Listens on localhost:4918, plain http, no ssl.
//  Connect to http://localhost:4918/
//
//  Without --dir it serves an in-memory object store. Log in with any
//  username and a non-empty password.
//

use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use futures_util::future::TryFutureExt;

use s3dav::store::{memstore::MemStore, ConnectionPool};
use s3dav::{DavHandler, FileSystem, LockSystem};

#[derive(Debug, clap::Parser)]
#[command(about, version)]
struct Cli {
    /// port to listen on
    #[arg(short, long, default_value = "4918")]
    port: u16,
    /// local directory to serve
    #[arg(short, long)]
    dir: Option<String>,
    /// buckets to create in the in-memory store
    #[arg(short, long, default_value = "scratch")]
    bucket: Vec<String>,
    /// cache directory (default: a temporary directory)
    #[arg(short, long)]
    cache: Option<PathBuf>,
    /// S3 endpoint instead of the in-memory store
    #[cfg(feature = "s3")]
    #[arg(long)]
    endpoint: Option<String>,
    /// S3 region
    #[cfg(feature = "s3")]
    #[arg(long, default_value = "us-east-1")]
    region: String,
    /// use ephemeral memory locksystem
    #[arg(short = 'l', long)]
    memls: bool,
    /// use fake memory locksystem
    #[arg(short, long)]
    fakels: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let port = cli.port;

    let tmp_cache;
    let cache = match &cli.cache {
        Some(dir) => dir.clone(),
        None => {
            tmp_cache = tempfile::tempdir()?;
            tmp_cache.path().to_path_buf()
        }
    };

    let (fs, name) = match &cli.dir {
        Some(dir) => (FileSystem::local(dir), dir.clone()),
        None => (FileSystem::object_store(pool(&cli), &cache), store_name(&cli)),
    };
    let ls = if cli.memls || !cli.fakels {
        LockSystem::Mem
    } else {
        LockSystem::Fake
    };
    let dav_server = DavHandler::builder(fs).locksystem(ls).build();
    serve(dav_server, &name, port).await
}

#[cfg(feature = "s3")]
fn pool(cli: &Cli) -> std::sync::Arc<ConnectionPool> {
    use s3dav::store::s3::{connector, S3Config};
    match &cli.endpoint {
        Some(endpoint) => ConnectionPool::new(connector(S3Config {
            region: cli.region.clone(),
            endpoint_url: Some(endpoint.clone()),
            force_path_style: true,
        })),
        None => memory_pool(&cli.bucket),
    }
}

#[cfg(not(feature = "s3"))]
fn pool(cli: &Cli) -> std::sync::Arc<ConnectionPool> {
    memory_pool(&cli.bucket)
}

fn memory_pool(buckets: &[String]) -> std::sync::Arc<ConnectionPool> {
    let store = MemStore::new();
    for bucket in buckets {
        store.add_bucket(bucket);
    }
    ConnectionPool::single(store)
}

fn store_name(cli: &Cli) -> String {
    #[cfg(feature = "s3")]
    {
        if let Some(endpoint) = &cli.endpoint {
            return endpoint.clone();
        }
    }
    format!("memory store with buckets {}", cli.bucket.join(", "))
}

async fn serve(dav_server: DavHandler, name: &str, port: u16) -> Result<(), Box<dyn Error>> {
    let make_service = hyper::service::make_service_fn(|_| {
        let dav_server = dav_server.clone();
        async move {
            let func = move |req: hyper::Request<hyper::Body>| {
                let dav_server = dav_server.clone();
                async move { Ok::<_, Infallible>(dav_server.handle(req).await) }
            };
            Ok::<_, hyper::Error>(hyper::service::service_fn(func))
        }
    });

    let addr = format!("0.0.0.0:{}", port);
    let addr = SocketAddr::from_str(&addr)?;

    let server = hyper::Server::try_bind(&addr)?
        .serve(make_service)
        .map_err(|e| eprintln!("server error: {}", e));

    println!("Serving {} on {}", name, port);
    let _ = server.await;
    Ok(())
}
