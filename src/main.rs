// Signed metadata server for image collections: keeps a root, targets,
// snapshot and timestamp document per image name and re-signs them in order
// whenever a tag is added or removed.
//
// Could be better:
// * threshold signing (roles carry one key each)
// * key rotation
#[macro_use]
extern crate log;
use actix_web::http::StatusCode;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::Deserialize;
use std::sync::Arc;

mod error;
mod keys;
mod metadata;
mod pipeline;
mod repo;
mod store;

use error::{Error, ErrorKind};
use metadata::FileMeta;
use pipeline::{Pipeline, Settings};
use store::{BlobStore, FileStore, MemoryStore};

#[derive(Debug)]
struct Config {
    /// Where collections are persisted. In memory when unset.
    store_root: Option<std::path::PathBuf>,
    listen: String,
    settings: Settings,
}

type HandlerPipeline = web::Data<Arc<Pipeline>>;

fn error_response(err: &Error) -> HttpResponse {
    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Signing | ErrorKind::Store | ErrorKind::KeyGen => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("{}", err);
    }
    HttpResponse::build(status)
        .content_type("text/plain")
        .body(err.to_string())
}

fn index() -> HttpResponse {
    HttpResponse::Ok().json("{}")
}

fn get_metadata(pipeline: HandlerPipeline, info: web::Path<(String, String)>) -> HttpResponse {
    match pipeline.get_document(&info.0, &info.1) {
        Ok(blob) => {
            let content_type = if info.1.ends_with(".gz") {
                "application/gzip"
            } else {
                "application/json"
            };
            HttpResponse::Ok().content_type(content_type).body(blob)
        }
        Err(e) => error_response(&e),
    }
}

fn add_target(
    pipeline: HandlerPipeline,
    info: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    info!("adding {} to {}", info.1, info.0);
    let result = FileMeta::parse(&body).and_then(|meta| pipeline.add_target(&info.0, &info.1, meta));
    match result {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => error_response(&e),
    }
}

fn remove_target(pipeline: HandlerPipeline, info: web::Path<(String, String)>) -> HttpResponse {
    info!("removing {} from {}", info.1, info.0);
    match pipeline.remove_target(&info.0, &info.1) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => error_response(&e),
    }
}

fn provision_keys(pipeline: HandlerPipeline, collection: web::Path<String>) -> HttpResponse {
    info!("provisioning keys for {}", collection);
    match pipeline.provision_keys(&collection) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => error_response(&e),
    }
}

/// Collection names may contain `/`, so they take the greedy part of the path.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route(
            "/{collection:.+}/{file:(?:root|targets|snapshot|timestamp)\\.json(?:\\.gz)?}",
            web::get().to(get_metadata),
        )
        .route("/{collection:.+}/init", web::post().to(provision_keys))
        .route("/{collection:.+}/{tag}", web::post().to(add_target))
        .route("/{collection:.+}/{tag}", web::delete().to(remove_target));
}

const USAGE: &str = "
Usage: tufcr [--store-root STOREROOT] [--listen ADDR] [--compression MODE] [--auto-provision]
       tufcr (-h | --help)

Options:
    -h, --help               Show this message
    --store-root STOREROOT   Where to persist metadata (e.g. persistent disk); in memory if omitted
    --listen ADDR            Address to bind [default: 127.0.0.1:4443]
    --compression MODE       Snapshot compression, none or gzip [default: none]
    --auto-provision         Generate role keys on the first change to a collection
";

#[derive(Deserialize, Debug)]
struct Args {
    flag_store_root: Option<String>,
    flag_listen: String,
    flag_compression: String,
    flag_auto_provision: bool,
}

impl Config {
    fn from_args(args: Args) -> Result<Config, String> {
        Ok(Config {
            store_root: args.flag_store_root.map(std::path::PathBuf::from),
            listen: args.flag_listen,
            settings: Settings {
                compression: args.flag_compression.parse()?,
                auto_provision: args.flag_auto_provision,
            },
        })
    }

    fn open_store(&self) -> std::io::Result<Arc<dyn BlobStore>> {
        match &self.store_root {
            Some(root) => {
                let store = FileStore::open(root)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                Ok(Arc::new(store))
            }
            None => {
                warn!("no --store-root given, metadata is kept in memory only");
                Ok(Arc::new(MemoryStore::default()))
            }
        }
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args: Args = docopt::Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let config = Config::from_args(args)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    info!("starting with {:?}", config);

    let pipeline = web::Data::new(Arc::new(Pipeline::new(
        config.open_store()?,
        config.settings,
    )));
    info!(
        "snapshot compression: {}",
        pipeline.settings().compression
    );

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .register_data(pipeline.clone())
            .configure(routes)
    })
    .bind(&config.listen)?
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::Method;
    use actix_web::test;
    use crate::metadata::{self, Snapshot, Targets};

    const BODY: &str = r#"{"length": 1024, "hashes": {"sha256": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"}}"#;

    fn pipeline(auto_provision: bool) -> HandlerPipeline {
        web::Data::new(Arc::new(Pipeline::new(
            Arc::new(MemoryStore::default()),
            Settings {
                auto_provision,
                ..Settings::default()
            },
        )))
    }

    #[test]
    fn index_returns_empty_object() {
        let mut app = test::init_service(App::new().register_data(pipeline(false)).configure(routes));
        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&mut app, req);
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/").to_request();
        let body = test::read_response(&mut app, req);
        assert_eq!(body.to_vec(), b"\"{}\"".to_vec());
    }

    #[test]
    fn add_then_fetch() {
        let data = pipeline(false);
        let mut app = test::init_service(App::new().register_data(data.clone()).configure(routes));

        let req = test::TestRequest::post().uri("/library/app/init").to_request();
        assert_eq!(test::call_service(&mut app, req).status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/library/app/v1")
            .set_payload(BODY)
            .to_request();
        assert_eq!(test::call_service(&mut app, req).status(), StatusCode::OK);

        let req = test::TestRequest::get()
            .uri("/library/app/targets.json")
            .to_request();
        let body = test::read_response(&mut app, req);
        assert_eq!(
            body.to_vec(),
            data.get_document("library/app", "targets.json").unwrap()
        );
        let targets = metadata::decode::<Targets>(&body).unwrap();
        assert_eq!(targets.signed.targets["v1"].length, 1024);

        let req = test::TestRequest::get()
            .uri("/library/app/snapshot.json")
            .to_request();
        let body = test::read_response(&mut app, req);
        let snapshot = metadata::decode::<Snapshot>(&body).unwrap();
        assert_eq!(snapshot.signed.meta["targets.json"].version, 1);
    }

    #[test]
    fn delete_removes_tag() {
        let data = pipeline(true);
        let mut app = test::init_service(App::new().register_data(data.clone()).configure(routes));
        let req = test::TestRequest::post()
            .uri("/app/v1")
            .set_payload(BODY)
            .to_request();
        assert_eq!(test::call_service(&mut app, req).status(), StatusCode::OK);

        let req = test::TestRequest::default()
            .method(Method::DELETE)
            .uri("/app/v1")
            .to_request();
        assert_eq!(test::call_service(&mut app, req).status(), StatusCode::OK);

        let blob = data.get_document("app", "targets.json").unwrap();
        let targets = metadata::decode::<Targets>(&blob).unwrap();
        assert!(targets.signed.targets.is_empty());
    }

    #[test]
    fn maps_errors_to_statuses() {
        let mut app = test::init_service(App::new().register_data(pipeline(false)).configure(routes));

        let req = test::TestRequest::get()
            .uri("/unknown-collection/targets.json")
            .to_request();
        assert_eq!(test::call_service(&mut app, req).status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/app/v1")
            .set_payload("{\"length\": 3}")
            .to_request();
        assert_eq!(test::call_service(&mut app, req).status(), StatusCode::BAD_REQUEST);

        // no keys and no auto-provisioning
        let req = test::TestRequest::post()
            .uri("/app/v1")
            .set_payload(BODY)
            .to_request();
        assert_eq!(
            test::call_service(&mut app, req).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn parses_arguments() {
        let args: Args = docopt::Docopt::new(USAGE)
            .and_then(|d| {
                d.argv(vec!["tufcr", "--compression", "gzip", "--auto-provision"])
                    .deserialize()
            })
            .unwrap();
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.listen, "127.0.0.1:4443");
        assert!(config.store_root.is_none());
        assert!(config.settings.auto_provision);
        assert_eq!(config.settings.compression, repo::Compression::Gzip);

        let args: Args = docopt::Docopt::new(USAGE)
            .and_then(|d| d.argv(vec!["tufcr", "--compression", "zip"]).deserialize())
            .unwrap();
        assert!(Config::from_args(args).is_err());
    }
}
