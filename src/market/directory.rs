//! Maker directory capability.

use std::sync::{Arc, RwLock};

use crate::{error::NetError, taker::offers::MakerAddress};

/// Source of maker endpoints.
pub trait MakerDirectory: Send + Sync {
    /// Current list of maker addresses.
    fn maker_addresses(&self) -> Result<Vec<MakerAddress>, NetError>;
}

/// A fixed list of makers, typically the `maker_addresses` of the taker config.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    addresses: RwLock<Vec<MakerAddress>>,
}

impl StaticDirectory {
    /// Builds a directory from already parsed addresses.
    pub fn new(addresses: Vec<MakerAddress>) -> Self {
        Self {
            addresses: RwLock::new(addresses),
        }
    }

    /// Parses `host:port` entries, skipping malformed ones.
    pub fn from_strings<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses = entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.into();
                match MakerAddress::try_from(entry.clone()) {
                    Ok(address) => Some(address),
                    Err(e) => {
                        log::warn!("Ignoring invalid maker address {entry}: {e}");
                        None
                    }
                }
            })
            .collect();
        Self::new(addresses)
    }

    /// Adds a maker to the list.
    pub fn add(&self, address: MakerAddress) {
        if let Ok(mut addresses) = self.addresses.write() {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
    }
}

impl MakerDirectory for StaticDirectory {
    fn maker_addresses(&self) -> Result<Vec<MakerAddress>, NetError> {
        self.addresses
            .read()
            .map(|addresses| addresses.clone())
            .map_err(|_| NetError::ReachedEOF)
    }
}

/// Union of several directories.
///
/// Addresses are de-duplicated, first source wins the order. Fails only when every source fails.
pub struct MultiDirectory {
    sources: Vec<Arc<dyn MakerDirectory>>,
}

impl MultiDirectory {
    /// Combines `sources`.
    pub fn new(sources: Vec<Arc<dyn MakerDirectory>>) -> Self {
        Self { sources }
    }
}

impl MakerDirectory for MultiDirectory {
    fn maker_addresses(&self) -> Result<Vec<MakerAddress>, NetError> {
        let mut addresses: Vec<MakerAddress> = Vec::new();
        let mut last_error = None;
        let mut any_ok = self.sources.is_empty();
        for source in &self.sources {
            match source.maker_addresses() {
                Ok(found) => {
                    any_ok = true;
                    for address in found {
                        if !addresses.contains(&address) {
                            addresses.push(address);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Maker directory unavailable: {e:?}");
                    last_error = Some(e);
                }
            }
        }
        match (any_ok, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(addresses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_directory_skips_malformed_entries() {
        let directory = StaticDirectory::from_strings([
            "maker1.onion:6102",
            "no-port",
            "maker2.onion:16102",
        ]);
        let addresses = directory.maker_addresses().unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].to_string(), "maker1.onion:6102");

        directory.add(addresses[0].clone());
        assert_eq!(directory.maker_addresses().unwrap().len(), 2);
    }

    struct DownDirectory;

    impl MakerDirectory for DownDirectory {
        fn maker_addresses(&self) -> Result<Vec<MakerAddress>, NetError> {
            Err(NetError::ConnectionRefused)
        }
    }

    #[test]
    fn multi_directory_merges_and_tolerates_failures() {
        let a: Arc<dyn MakerDirectory> =
            Arc::new(StaticDirectory::from_strings(["m1.onion:1", "m2.onion:2"]));
        let b: Arc<dyn MakerDirectory> =
            Arc::new(StaticDirectory::from_strings(["m2.onion:2", "m3.onion:3"]));
        let down: Arc<dyn MakerDirectory> = Arc::new(DownDirectory);

        let merged = MultiDirectory::new(vec![a, down.clone(), b]);
        let addresses = merged.maker_addresses().unwrap();
        assert_eq!(addresses.len(), 3);

        assert!(MultiDirectory::new(vec![down]).maker_addresses().is_err());
    }
}
