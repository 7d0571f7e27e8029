//! Pure compose transformation: domain routing injection and name isolation.
//!
//! No I/O happens here. Output depends only on the inputs, so identical
//! calls render byte-for-byte identical documents and re-applying the same
//! isolation suffix changes nothing.

use serde_yaml::{Mapping, Value};

use crate::compose::doc::ComposeDocument;
use crate::errors::EngineError;
use crate::models::resource::DomainBinding;

/// External ingress network shared with the reverse proxy
pub const INGRESS_NETWORK: &str = "dockhand-network";

/// Transform a compose document for deployment.
///
/// Domain bindings become reverse-proxy routing labels on their target
/// services; when an isolation suffix is given, every service, network and
/// volume name is rewritten (totally, including cross-references) so
/// parallel deployments of the same resource can coexist.
pub fn transform(
    doc: &ComposeDocument,
    domains: &[DomainBinding],
    project: &str,
    isolation_suffix: Option<&str>,
) -> Result<ComposeDocument, EngineError> {
    let mut root = doc.root().clone();

    inject_domains(&mut root, domains, project)?;
    if let Some(suffix) = isolation_suffix {
        apply_isolation(&mut root, suffix);
    }

    Ok(ComposeDocument::from_mapping(root))
}

// ============================ DOMAIN INJECTION =========================== //

fn inject_domains(
    root: &mut Mapping,
    domains: &[DomainBinding],
    project: &str,
) -> Result<(), EngineError> {
    if domains.is_empty() {
        return Ok(());
    }

    // Validate every binding before touching the document so a bad one
    // yields an error and no partial output.
    for binding in domains {
        let exists = matches!(
            root.get("services"),
            Some(Value::Mapping(services)) if services.contains_key(binding.service_name.as_str())
        );
        if !exists {
            return Err(EngineError::UnknownService(binding.service_name.clone()));
        }
    }

    for (idx, binding) in domains.iter().enumerate() {
        let router = format!("{}-{}-{}", project, binding.service_name, idx);

        let service = service_mut(root, &binding.service_name);

        ensure_label(service, "traefik.enable", "true");

        let rule = match &binding.path {
            Some(path) => format!(
                "Host(`{}`) && PathPrefix(`{}`)",
                binding.host, path
            ),
            None => format!("Host(`{}`)", binding.host),
        };
        ensure_label(
            service,
            &format!("traefik.http.routers.{router}.rule"),
            &rule,
        );
        ensure_label(
            service,
            &format!("traefik.http.routers.{router}.service"),
            &router,
        );

        match &binding.cert_resolver {
            Some(resolver) => {
                ensure_label(
                    service,
                    &format!("traefik.http.routers.{router}.entrypoints"),
                    "websecure",
                );
                ensure_label(
                    service,
                    &format!("traefik.http.routers.{router}.tls.certresolver"),
                    resolver,
                );
            }
            None => {
                ensure_label(
                    service,
                    &format!("traefik.http.routers.{router}.entrypoints"),
                    "web",
                );
            }
        }

        ensure_label(
            service,
            &format!("traefik.http.services.{router}.loadbalancer.server.port"),
            &binding.port.to_string(),
        );

        attach_ingress_network(service);
    }

    declare_ingress_network(root);
    Ok(())
}

fn service_mut<'a>(root: &'a mut Mapping, name: &str) -> &'a mut Mapping {
    let services = root
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .expect("services mapping validated at parse time");

    match services.get_mut(name) {
        Some(Value::Mapping(service)) => service,
        Some(other) => {
            // Normalize scalar/null service bodies to a mapping
            *other = Value::Mapping(Mapping::new());
            other.as_mapping_mut().unwrap()
        }
        None => unreachable!("binding validated against service names"),
    }
}

/// Add a label to a service, respecting whichever style (list or map) the
/// document already uses. Re-adding an existing label is a no-op.
fn ensure_label(service: &mut Mapping, key: &str, value: &str) {
    let rendered = format!("{key}={value}");

    match service.get_mut("labels") {
        Some(Value::Sequence(labels)) => {
            let present = labels
                .iter()
                .any(|l| l.as_str() == Some(rendered.as_str()));
            if !present {
                labels.push(Value::String(rendered));
            }
        }
        Some(Value::Mapping(labels)) => {
            labels.insert(
                Value::String(key.to_string()),
                Value::String(value.to_string()),
            );
        }
        _ => {
            service.insert(
                Value::String("labels".to_string()),
                Value::Sequence(vec![Value::String(rendered)]),
            );
        }
    }
}

/// Join the service to the ingress network. A service without an explicit
/// `networks` key is also kept on the compose default network so
/// inter-service discovery keeps working.
fn attach_ingress_network(service: &mut Mapping) {
    match service.get_mut("networks") {
        Some(Value::Sequence(networks)) => {
            let present = networks.iter().any(|n| n.as_str() == Some(INGRESS_NETWORK));
            if !present {
                networks.push(Value::String(INGRESS_NETWORK.to_string()));
            }
        }
        Some(Value::Mapping(networks)) => {
            if !networks.contains_key(INGRESS_NETWORK) {
                networks.insert(Value::String(INGRESS_NETWORK.to_string()), Value::Null);
            }
        }
        _ => {
            service.insert(
                Value::String("networks".to_string()),
                Value::Sequence(vec![
                    Value::String("default".to_string()),
                    Value::String(INGRESS_NETWORK.to_string()),
                ]),
            );
        }
    }
}

fn declare_ingress_network(root: &mut Mapping) {
    let networks = match root.get_mut("networks") {
        Some(Value::Mapping(networks)) => networks,
        _ => {
            root.insert(
                Value::String("networks".to_string()),
                Value::Mapping(Mapping::new()),
            );
            root.get_mut("networks")
                .and_then(Value::as_mapping_mut)
                .unwrap()
        }
    };

    if !networks.contains_key(INGRESS_NETWORK) {
        let mut external = Mapping::new();
        external.insert(Value::String("external".to_string()), Value::Bool(true));
        networks.insert(
            Value::String(INGRESS_NETWORK.to_string()),
            Value::Mapping(external),
        );
    }
}

// =============================== ISOLATION =============================== //

fn suffixed(name: &str, suffix: &str) -> String {
    let tail = format!("-{suffix}");
    if name.ends_with(&tail) {
        name.to_string()
    } else {
        format!("{name}{tail}")
    }
}

/// Whether a top-level network/volume entry is marked external. External
/// resources exist outside the stack and must keep their names.
fn is_external(value: &Value) -> bool {
    matches!(
        value.as_mapping().and_then(|m| m.get("external")),
        Some(Value::Bool(true)) | Some(Value::Mapping(_))
    )
}

/// Names declared under a top-level section, externals excluded
fn renameable_names(root: &Mapping, section: &str) -> Vec<String> {
    match root.get(section) {
        Some(Value::Mapping(entries)) => entries
            .iter()
            .filter(|(_, v)| !is_external(v))
            .filter_map(|(k, _)| k.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn apply_isolation(root: &mut Mapping, suffix: &str) {
    let service_names = match root.get("services") {
        Some(Value::Mapping(services)) => services
            .keys()
            .filter_map(|k| k.as_str().map(String::from))
            .collect::<Vec<_>>(),
        _ => Vec::new(),
    };
    let network_names = renameable_names(root, "networks");
    let volume_names = renameable_names(root, "volumes");

    if let Some(Value::Mapping(services)) = root.get_mut("services") {
        let old = std::mem::take(services);
        for (key, mut body) in old {
            if let Some(service) = body.as_mapping_mut() {
                rewrite_service_refs(
                    service,
                    suffix,
                    &service_names,
                    &network_names,
                    &volume_names,
                );
            }
            let new_key = match key.as_str() {
                Some(name) => Value::String(suffixed(name, suffix)),
                None => key,
            };
            services.insert(new_key, body);
        }
    }

    rename_section_keys(root, "networks", suffix);
    rename_section_keys(root, "volumes", suffix);
}

fn rename_section_keys(root: &mut Mapping, section: &str, suffix: &str) {
    if let Some(Value::Mapping(entries)) = root.get_mut(section) {
        let old = std::mem::take(entries);
        for (key, body) in old {
            let new_key = match key.as_str() {
                Some(name) if !is_external(&body) => Value::String(suffixed(name, suffix)),
                _ => key,
            };
            entries.insert(new_key, body);
        }
    }
}

fn rewrite_service_refs(
    service: &mut Mapping,
    suffix: &str,
    service_names: &[String],
    network_names: &[String],
    volume_names: &[String],
) {
    if let Some(Value::String(name)) = service.get_mut("container_name") {
        *name = suffixed(name, suffix);
    }

    match service.get_mut("depends_on") {
        Some(Value::Sequence(deps)) => {
            for dep in deps {
                rewrite_if_named(dep, suffix, service_names);
            }
        }
        Some(Value::Mapping(deps)) => {
            let old = std::mem::take(deps);
            for (key, body) in old {
                let new_key = match key.as_str() {
                    Some(name) if service_names.iter().any(|s| s == name) => {
                        Value::String(suffixed(name, suffix))
                    }
                    _ => key,
                };
                deps.insert(new_key, body);
            }
        }
        _ => {}
    }

    if let Some(Value::Sequence(links)) = service.get_mut("links") {
        for link in links {
            if let Value::String(entry) = link {
                // "service" or "service:alias"
                let (target, alias) = match entry.split_once(':') {
                    Some((t, a)) => (t, Some(a)),
                    None => (entry.as_str(), None),
                };
                if service_names.iter().any(|s| s == target) {
                    let renamed = suffixed(target, suffix);
                    *entry = match alias {
                        Some(alias) => format!("{renamed}:{alias}"),
                        None => renamed,
                    };
                }
            }
        }
    }

    match service.get_mut("networks") {
        Some(Value::Sequence(networks)) => {
            for network in networks {
                rewrite_if_named(network, suffix, network_names);
            }
        }
        Some(Value::Mapping(networks)) => {
            let old = std::mem::take(networks);
            for (key, body) in old {
                let new_key = match key.as_str() {
                    Some(name) if network_names.iter().any(|n| n == name) => {
                        Value::String(suffixed(name, suffix))
                    }
                    _ => key,
                };
                networks.insert(new_key, body);
            }
        }
        _ => {}
    }

    if let Some(Value::Sequence(volumes)) = service.get_mut("volumes") {
        for volume in volumes {
            match volume {
                // Short form: "source:/target[:mode]", bind mounts untouched
                Value::String(entry) => {
                    if let Some((source, rest)) = entry.split_once(':') {
                        if volume_names.iter().any(|v| v == source) {
                            *entry = format!("{}:{}", suffixed(source, suffix), rest);
                        }
                    }
                }
                // Long form: {type: volume, source: ..., target: ...}
                Value::Mapping(mount) => {
                    let is_volume = mount
                        .get("type")
                        .and_then(Value::as_str)
                        .map(|t| t == "volume")
                        .unwrap_or(false);
                    if is_volume {
                        if let Some(Value::String(source)) = mount.get_mut("source") {
                            if volume_names.iter().any(|v| v == source.as_str()) {
                                *source = suffixed(source, suffix);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn rewrite_if_named(value: &mut Value, suffix: &str, names: &[String]) {
    if let Value::String(name) = value {
        if names.iter().any(|n| n == name.as_str()) {
            *name = suffixed(name, suffix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resource::DomainBinding;

    const DOC: &str = "\
services:
  web:
    image: nginx
    depends_on:
      - db
    networks:
      - backend
    volumes:
      - data:/var/lib/app
      - ./conf:/etc/app:ro
  db:
    image: postgres
    container_name: app-db
networks:
  backend: {}
volumes:
  data: {}
";

    fn binding(service: &str) -> DomainBinding {
        DomainBinding {
            host: "app.example.com".to_string(),
            port: 80,
            path: None,
            service_name: service.to_string(),
            cert_resolver: None,
        }
    }

    fn doc() -> ComposeDocument {
        ComposeDocument::from_yaml_str(DOC).unwrap()
    }

    #[test]
    fn test_domain_injection_adds_labels_and_network() {
        let out = transform(&doc(), &[binding("web")], "myapp", None).unwrap();
        let yaml = out.to_yaml().unwrap();

        assert!(yaml.contains("traefik.enable=true"));
        assert!(yaml.contains("traefik.http.routers.myapp-web-0.rule=Host(`app.example.com`)"));
        assert!(yaml.contains("traefik.http.services.myapp-web-0.loadbalancer.server.port=80"));
        assert!(yaml.contains(INGRESS_NETWORK));
        // The proxy network is declared external at top level
        let root = out.root();
        let networks = root.get("networks").unwrap().as_mapping().unwrap();
        assert!(is_external(networks.get(INGRESS_NETWORK).unwrap()));
    }

    #[test]
    fn test_domain_injection_with_path_and_tls() {
        let mut b = binding("web");
        b.path = Some("/api".to_string());
        b.cert_resolver = Some("letsencrypt".to_string());

        let out = transform(&doc(), &[b], "myapp", None).unwrap();
        let yaml = out.to_yaml().unwrap();

        assert!(yaml.contains("Host(`app.example.com`) && PathPrefix(`/api`)"));
        assert!(yaml.contains("traefik.http.routers.myapp-web-0.tls.certresolver=letsencrypt"));
        assert!(yaml.contains("traefik.http.routers.myapp-web-0.entrypoints=websecure"));
    }

    #[test]
    fn test_unknown_service_fails_without_partial_output() {
        let err = transform(&doc(), &[binding("ghost")], "myapp", None).unwrap_err();
        assert!(matches!(err, EngineError::UnknownService(name) if name == "ghost"));
    }

    #[test]
    fn test_transform_deterministic() {
        let a = transform(&doc(), &[binding("web")], "myapp", Some("abc123"))
            .unwrap()
            .to_yaml()
            .unwrap();
        let b = transform(&doc(), &[binding("web")], "myapp", Some("abc123"))
            .unwrap()
            .to_yaml()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_isolation_rename_is_total() {
        let out = transform(&doc(), &[], "myapp", Some("pr42")).unwrap();

        // Every declared name carries the suffix
        assert_eq!(out.service_names(), vec!["web-pr42", "db-pr42"]);
        let root = out.root();
        let networks = root.get("networks").unwrap().as_mapping().unwrap();
        assert!(networks.contains_key("backend-pr42"));
        let volumes = root.get("volumes").unwrap().as_mapping().unwrap();
        assert!(volumes.contains_key("data-pr42"));

        // Cross-references follow the rename
        let yaml = out.to_yaml().unwrap();
        assert!(yaml.contains("- db-pr42"));
        assert!(yaml.contains("- backend-pr42"));
        assert!(yaml.contains("data-pr42:/var/lib/app"));
        assert!(yaml.contains("container_name: app-db-pr42"));
        // Bind mounts are not volume names and stay as-is
        assert!(yaml.contains("./conf:/etc/app:ro"));
    }

    #[test]
    fn test_isolation_idempotent_for_same_suffix() {
        let once = transform(&doc(), &[binding("web")], "myapp", Some("pr42")).unwrap();
        let twice = transform(&once, &[], "myapp", Some("pr42")).unwrap();
        assert_eq!(once.to_yaml().unwrap(), twice.to_yaml().unwrap());
    }

    #[test]
    fn test_isolation_keeps_external_networks() {
        let out = transform(&doc(), &[binding("web")], "myapp", Some("pr42")).unwrap();
        let root = out.root();
        let networks = root.get("networks").unwrap().as_mapping().unwrap();
        // The ingress network is external and keeps its name
        assert!(networks.contains_key(INGRESS_NETWORK));
    }

    #[test]
    fn test_depends_on_map_form() {
        let doc = ComposeDocument::from_yaml_str(
            "\
services:
  web:
    image: nginx
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
",
        )
        .unwrap();

        let out = transform(&doc, &[], "myapp", Some("x1")).unwrap();
        let yaml = out.to_yaml().unwrap();
        assert!(yaml.contains("db-x1:"));
        assert!(yaml.contains("condition: service_healthy"));
    }
}
