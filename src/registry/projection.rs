//! Consumer-facing views of a registry snapshot

use super::RegistrySnapshot;
use crate::common::Result;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Domain name → addresses, for the DNS responder. Instances without
/// addresses have nothing to resolve to and are left out.
pub fn dns_records(snapshot: &RegistrySnapshot, suffix: &str) -> BTreeMap<String, Vec<IpAddr>> {
    snapshot
        .instances()
        .filter(|instance| !instance.addrs.is_empty())
        .map(|instance| {
            (
                instance.fully_qualified_domain_name(suffix),
                instance.addrs.clone(),
            )
        })
        .collect()
}

/// `"<ip>\t<fqdn>"` lines, ordered by qualified name then address order
pub fn host_entries(snapshot: &RegistrySnapshot, suffix: &str) -> Vec<String> {
    snapshot
        .instances()
        .flat_map(|instance| {
            let fqdn = instance.fully_qualified_domain_name(suffix);
            instance
                .addrs
                .iter()
                .map(move |addr| format!("{}\t{}", addr, fqdn))
        })
        .collect()
}

/// Replace `path` with `lines`, atomically: write a sibling temporary file,
/// sync it, then rename it over the target.
pub fn write_hosts_file(path: &Path, lines: &[String]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| crate::Error::Other(format!("not a file path: {}", path.display())))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// [`write_hosts_file`] on the blocking pool, for callers on the runtime
pub async fn publish_hosts_file(path: PathBuf, lines: Vec<String>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_hosts_file(&path, &lines))
        .await
        .map_err(|e| crate::Error::Internal(format!("hosts file writer: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Instance, InstanceId, InstanceUpdate};
    use crate::registry::InstanceRegistry;

    fn snapshot() -> RegistrySnapshot {
        let mut registry = InstanceRegistry::new();
        registry.apply(InstanceUpdate::add(
            Instance::new(InstanceId::new("prod", "web", 1))
                .with_addrs(["10.0.0.2".parse().unwrap(), "fd00::2".parse().unwrap()]),
        ));
        registry.apply(InstanceUpdate::add(
            Instance::new(InstanceId::new("prod", "web", 0)).with_addrs(["10.0.0.1".parse().unwrap()]),
        ));
        registry.apply(InstanceUpdate::add(Instance::new(InstanceId::new("prod", "db", 0))));
        registry.snapshot()
    }

    #[test]
    fn test_dns_records() {
        let records = dns_records(&snapshot(), "container");
        assert_eq!(records.len(), 2);
        assert_eq!(records["1.web.prod.container"].len(), 2);
        assert_eq!(records["0.web.prod.container"][0].to_string(), "10.0.0.1");
        assert!(!records.contains_key("0.db.prod.container"));
    }

    #[test]
    fn test_host_entries_order() {
        let lines = host_entries(&snapshot(), "container");
        assert_eq!(
            lines,
            vec![
                "10.0.0.1\t0.web.prod.container".to_string(),
                "10.0.0.2\t1.web.prod.container".to_string(),
                "fd00::2\t1.web.prod.container".to_string(),
            ]
        );
    }

    #[test]
    fn test_write_hosts_file_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "stale line\nanother\nand more\n").unwrap();

        write_hosts_file(&path, &host_entries(&snapshot(), "container")).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.starts_with("10.0.0.1\t0.web.prod.container\n"));
        assert!(!contents.contains("stale"));

        write_hosts_file(&path, &[]).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_publish_hosts_file_off_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        publish_hosts_file(path.clone(), host_entries(&snapshot(), "svc"))
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("fd00::2\t1.web.prod.svc"));

        let missing = dir.path().join("no-such-dir").join("hosts");
        assert!(matches!(
            publish_hosts_file(missing, Vec::new()).await,
            Err(crate::Error::Io(_))
        ));
    }
}
