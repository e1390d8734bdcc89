use crate::error::{Error, Result};

/// A destination path resolved to a cluster-native Service port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authority {
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

impl Authority {
    #[must_use]
    pub fn fqdn(&self, cluster_domain: &str) -> String {
        format!("{}.{}.svc.{cluster_domain}", self.name, self.namespace)
    }
}

/// Parses `service[.namespace[.svc[.<zone>]]][.]:port`. The port defaults to
/// 80 and the namespace to `default`. Hosts that carry a `svc` suffix under
/// a different zone, or that are not cluster-shaped at all, are not ours to
/// resolve.
pub fn parse_authority(path: &str, cluster_domain: &str) -> Result<Authority> {
    if path.matches(':').count() > 1 {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let (host, port) = match path.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidPath(path.to_string()))?;
            (host, port)
        }
        None => (path, 80),
    };
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let zone_suffix = format!(".svc.{cluster_domain}");
    let stripped = if let Some(prefix) = host.strip_suffix(&zone_suffix) {
        prefix
    } else if let Some(prefix) = host.strip_suffix(".svc") {
        prefix
    } else if host.contains(".svc.") {
        // A service host under someone else's zone.
        return Err(Error::HostNotFound(host.to_string()));
    } else {
        host
    };

    let mut labels = stripped.split('.');
    let name = labels
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
    let namespace = match labels.next() {
        Some(ns) if ns.is_empty() => return Err(Error::InvalidPath(path.to_string())),
        Some(ns) => ns,
        None => "default",
    };
    if labels.next().is_some() {
        return Err(Error::HostNotFound(host.to_string()));
    }

    Ok(Authority {
        name: name.to_string(),
        namespace: namespace.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "cluster.local";

    fn parse(path: &str) -> Result<Authority> {
        parse_authority(path, ZONE)
    }

    #[test]
    fn fully_qualified_host() {
        let auth = parse("api.shop.svc.cluster.local:8080").unwrap();
        assert_eq!(auth.name, "api");
        assert_eq!(auth.namespace, "shop");
        assert_eq!(auth.port, 8080);
    }

    #[test]
    fn trailing_dot_is_accepted() {
        let auth = parse("api.shop.svc.cluster.local.:80").unwrap();
        assert_eq!(auth.namespace, "shop");
    }

    #[test]
    fn missing_port_defaults_to_80() {
        assert_eq!(parse("api.shop.svc.cluster.local").unwrap().port, 80);
    }

    #[test]
    fn short_forms_resolve() {
        let auth = parse("api:9090").unwrap();
        assert_eq!(auth.name, "api");
        assert_eq!(auth.namespace, "default");

        let auth = parse("api.shop:9090").unwrap();
        assert_eq!(auth.namespace, "shop");

        let auth = parse("api.shop.svc:9090").unwrap();
        assert_eq!(auth.namespace, "shop");
    }

    #[test]
    fn foreign_zone_is_not_found() {
        assert!(matches!(
            parse("api.shop.svc.other.zone:80"),
            Err(Error::HostNotFound(_))
        ));
    }

    #[test]
    fn non_cluster_hosts_are_not_found() {
        assert!(matches!(
            parse("example.com.extra:80"),
            Err(Error::HostNotFound(_))
        ));
    }

    #[test]
    fn multiple_colons_are_invalid() {
        assert!(matches!(
            parse("[2001:db8::1]:80"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn garbage_ports_are_invalid() {
        assert!(matches!(parse("api.shop:http"), Err(Error::InvalidPath(_))));
        assert!(matches!(parse("api.shop:99999"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn empty_labels_are_invalid() {
        assert!(matches!(parse(":80"), Err(Error::InvalidPath(_))));
        assert!(matches!(parse(".shop:80"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn fqdn_round_trip() {
        let auth = parse("api.shop.svc.cluster.local:80").unwrap();
        assert_eq!(auth.fqdn(ZONE), "api.shop.svc.cluster.local");
    }
}
