use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use std::num::NonZeroU16;

/// A `HashSet` specialized for ports.
///
/// Because ports are `NonZeroU16` values, this type avoids the overhead of
/// actually hashing ports.
pub type PortSet = std::collections::HashSet<NonZeroU16, std::hash::BuildHasherDefault<PortHasher>>;

/// A `HashMap` specialized for ports.
#[allow(dead_code)]
pub(crate) type PortMap<V> =
    std::collections::HashMap<NonZeroU16, V, std::hash::BuildHasherDefault<PortHasher>>;

/// A hasher for ports.
///
/// Because ports are single `NonZeroU16` values, we don't have to hash them;
/// we can just use the integer values as hashes directly.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

/// Reads `annotation` from the provided set of annotations, parsing it as a
/// port set. If the annotation is not set, `None` is returned; if it is
/// invalid, the empty set is returned.
pub(crate) fn ports_annotation(
    annotations: &std::collections::BTreeMap<String, String>,
    annotation: &str,
) -> Option<PortSet> {
    annotations.get(annotation).map(|spec| {
        parse_portset(spec).unwrap_or_else(|error| {
            tracing::info!(%spec, %error, %annotation, "Invalid ports list");
            Default::default()
        })
    })
}

/// Reads `annotation`, additionally resolving container port names against
/// `named_ports` (the opaque-ports annotation may reference ports by name).
pub(crate) fn named_ports_annotation(
    annotations: &std::collections::BTreeMap<String, String>,
    annotation: &str,
    named_ports: &HashMap<String, NonZeroU16>,
) -> Option<PortSet> {
    annotations.get(annotation).map(|spec| {
        parse_portset_named(spec, named_ports).unwrap_or_else(|error| {
            tracing::info!(%spec, %error, %annotation, "Invalid ports list");
            Default::default()
        })
    })
}

/// Read a comma-separated list of ports or port ranges from the given string.
pub fn parse_portset(s: &str) -> Result<PortSet> {
    parse_portset_named(s, &HashMap::default())
}

fn parse_portset_named(s: &str, named_ports: &HashMap<String, NonZeroU16>) -> Result<PortSet> {
    let mut ports = PortSet::default();

    for spec in s.split(',') {
        match spec.split_once('-') {
            None => {
                let spec = spec.trim();
                if spec.is_empty() {
                    continue;
                }
                if let Some(port) = named_ports.get(spec) {
                    ports.insert(*port);
                    continue;
                }
                let port = spec.parse().context("parsing port")?;
                ports.insert(port);
            }
            Some((floor, ceil)) => {
                let floor = floor.trim().parse::<NonZeroU16>().context("parsing port")?;
                let ceil = ceil.trim().parse::<NonZeroU16>().context("parsing port")?;
                if floor > ceil {
                    bail!("Port range must be increasing");
                }
                ports.extend(
                    (u16::from(floor)..=u16::from(ceil)).map(|p| NonZeroU16::try_from(p).unwrap()),
                );
            }
        }
    }

    Ok(ports)
}
