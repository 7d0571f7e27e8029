//! Compose transformer unit tests

use dockhand::compose::{transform, ComposeDocument};
use dockhand::errors::EngineError;
use dockhand::models::resource::DomainBinding;

const DOC: &str = "\
services:
  web:
    image: nginx
    depends_on:
      - db
  db:
    image: postgres
volumes:
  data: {}
";

fn binding(service: &str, host: &str) -> DomainBinding {
    DomainBinding {
        host: host.to_string(),
        port: 3000,
        path: None,
        service_name: service.to_string(),
        cert_resolver: None,
    }
}

#[test]
fn test_domains_and_isolation_compose() {
    let doc = ComposeDocument::from_yaml_str(DOC).unwrap();
    let out = transform(
        &doc,
        &[binding("web", "app.example.com")],
        "shop",
        Some("pr7"),
    )
    .unwrap();

    let yaml = out.to_yaml().unwrap();
    // Routing labels land on the bound service, names carry the suffix
    assert!(yaml.contains("traefik.http.routers.shop-web-0.rule=Host(`app.example.com`)"));
    assert_eq!(out.service_names(), vec!["web-pr7", "db-pr7"]);
    assert!(yaml.contains("- db-pr7"));
}

#[test]
fn test_multiple_bindings_get_distinct_routers() {
    let doc = ComposeDocument::from_yaml_str(DOC).unwrap();
    let out = transform(
        &doc,
        &[
            binding("web", "app.example.com"),
            binding("web", "www.example.com"),
        ],
        "shop",
        None,
    )
    .unwrap();

    let yaml = out.to_yaml().unwrap();
    assert!(yaml.contains("traefik.http.routers.shop-web-0.rule=Host(`app.example.com`)"));
    assert!(yaml.contains("traefik.http.routers.shop-web-1.rule=Host(`www.example.com`)"));
}

#[test]
fn test_unknown_service_is_rejected() {
    let doc = ComposeDocument::from_yaml_str(DOC).unwrap();
    let err = transform(&doc, &[binding("api", "api.example.com")], "shop", None).unwrap_err();
    assert!(matches!(err, EngineError::UnknownService(name) if name == "api"));
}

#[test]
fn test_toml_source_transforms_like_yaml() {
    let toml_doc = ComposeDocument::from_toml_str(
        "[services.web]\nimage = \"nginx\"\n\n[services.db]\nimage = \"postgres\"\n",
    )
    .unwrap();
    let yaml_doc = ComposeDocument::from_yaml_str(
        "services:\n  web:\n    image: nginx\n  db:\n    image: postgres\n",
    )
    .unwrap();

    let from_toml = transform(&toml_doc, &[binding("web", "x.example.com")], "app", None).unwrap();
    let from_yaml = transform(&yaml_doc, &[binding("web", "x.example.com")], "app", None).unwrap();
    assert_eq!(from_toml.to_yaml().unwrap(), from_yaml.to_yaml().unwrap());
    assert_eq!(from_toml.digest().unwrap(), from_yaml.digest().unwrap());
}

#[test]
fn test_reapplying_suffix_is_stable() {
    let doc = ComposeDocument::from_yaml_str(DOC).unwrap();
    let once = transform(&doc, &[], "shop", Some("pr7")).unwrap();
    let twice = transform(&once, &[], "shop", Some("pr7")).unwrap();
    assert_eq!(once.to_yaml().unwrap(), twice.to_yaml().unwrap());
}
