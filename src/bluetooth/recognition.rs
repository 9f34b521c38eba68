//! Recognition of the peripherals we are willing to link with.
//!
//! A device matches when it advertises one of the configured service
//! UUIDs or its name/alias contains one of the configured patterns. An
//! empty filter matches everything.

use std::collections::HashSet;

use smol_str::SmolStr;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
   pub uuids: Vec<Uuid>,
   /// Lowercased name fragments.
   pub name_patterns: Vec<SmolStr>,
}

impl ServiceFilter {
   pub fn new(uuids: Vec<Uuid>, patterns: &[String]) -> Self {
      Self {
         uuids,
         name_patterns: patterns
            .iter()
            .map(|p| SmolStr::new(p.to_ascii_lowercase()))
            .collect(),
      }
   }

   pub fn from_config(config: &Config) -> Self {
      Self::new(config.service_uuids.clone(), &config.name_patterns)
   }

   pub fn is_empty(&self) -> bool {
      self.uuids.is_empty() && self.name_patterns.is_empty()
   }

   fn matches_name(&self, name: &str) -> bool {
      let name = name.to_ascii_lowercase();
      self
         .name_patterns
         .iter()
         .any(|pattern| name.contains(pattern.as_str()))
   }

   pub fn matches(&self, uuids: Option<&HashSet<Uuid>>, names: &[&str]) -> bool {
      if self.is_empty() {
         return true;
      }
      if let Some(uuids) = uuids
         && self.uuids.iter().any(|u| uuids.contains(u))
      {
         return true;
      }
      names.iter().any(|name| self.matches_name(name))
   }

   pub async fn matches_device(&self, dev: &bluer::Device) -> bool {
      let uuids = dev.uuids().await.ok().flatten();
      let name = dev.name().await.ok().flatten();
      let alias = dev.alias().await.ok();

      let names: Vec<&str> = name.iter().chain(alias.iter()).map(String::as_str).collect();
      let matched = self.matches(uuids.as_ref(), &names);
      if matched {
         log::debug!("Peripheral {} matches filter", dev.address());
      }
      matched
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::config::{SPP_UUID, THERMAL_PRINTER_UUID};

   #[test]
   fn test_empty_filter_matches_anything() {
      let filter = ServiceFilter::default();
      assert!(filter.matches(None, &[]));
   }

   #[test]
   fn test_uuid_match() {
      let filter = ServiceFilter::new(vec![SPP_UUID], &[]);
      let advertised: HashSet<Uuid> = [THERMAL_PRINTER_UUID, SPP_UUID].into_iter().collect();
      assert!(filter.matches(Some(&advertised), &[]));
      let other: HashSet<Uuid> = [THERMAL_PRINTER_UUID].into_iter().collect();
      assert!(!filter.matches(Some(&other), &["Keyboard"]));
   }

   #[test]
   fn test_name_pattern_is_case_insensitive() {
      let filter = ServiceFilter::new(vec![SPP_UUID], &["TM-".to_string()]);
      assert!(filter.matches(None, &["Epson tm-m30"]));
      assert!(filter.matches(None, &["unknown", "TM-T20 alias"]));
      assert!(!filter.matches(None, &["Speaker"]));
   }
}
