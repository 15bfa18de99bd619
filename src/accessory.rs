//! Accessory identity and record key derivation.

use core::fmt;

use bluer::Address;
use serde::Serialize;
use smol_str::SmolStr;

use crate::config::KeyFormat;

/// Stable identity of a paired accessory.
///
/// The address is the unique key; the name is for display only and may
/// repeat across accessories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessoryIdentity {
   pub name: SmolStr,
   #[serde(serialize_with = "serialize_address")]
   pub address: Address,
}

fn serialize_address<S: serde::Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
   s.collect_str(address)
}

impl AccessoryIdentity {
   pub fn new(name: impl Into<SmolStr>, address: Address) -> Self {
      Self {
         name: name.into(),
         address,
      }
   }

   /// Derives the store key for this accessory.
   pub fn record_key(&self, format: KeyFormat) -> String {
      match format {
         KeyFormat::NameAndAddress => format!("{} [{}]", self.name, self.address),
         KeyFormat::Address => self.address.to_string(),
      }
   }
}

impl fmt::Display for AccessoryIdentity {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.name, self.address)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   #[test]
   fn test_record_key_formats() {
      let identity = AccessoryIdentity::new("Headphones", TEST_ADDRESS);
      assert_eq!(
         identity.record_key(KeyFormat::NameAndAddress),
         "Headphones [AA:BB:CC:DD:EE:FF]"
      );
      assert_eq!(identity.record_key(KeyFormat::Address), "AA:BB:CC:DD:EE:FF");
   }

   #[test]
   fn test_serializes_address_as_string() {
      let identity = AccessoryIdentity::new("Speaker", TEST_ADDRESS);
      let json = serde_json::to_value(&identity).unwrap();
      assert_eq!(json["name"], "Speaker");
      assert_eq!(json["address"], "AA:BB:CC:DD:EE:FF");
   }
}
