//! Audio profile classification by service UUID.
//!
//! BlueZ reports the services a device offers as 128-bit UUIDs built on the
//! Bluetooth base UUID. Only the 16-bit short form matters here.

use uuid::Uuid;

use crate::{audio::RouteType, router::ProfileType};

/// A2DP sink role (headphones, speakers)
pub const A2DP_SINK: u16 = 0x110B;
/// Headset Profile, headset role
pub const HSP_HS: u16 = 0x1108;
/// Headset Profile, audio gateway role
pub const HSP_AG: u16 = 0x1112;
/// Hands-Free Profile, hands-free role
pub const HFP_HF: u16 = 0x111E;
/// Hands-Free Profile, audio gateway role
pub const HFP_AG: u16 = 0x111F;

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SHORT_MASK: u128 = 0xFFFF_FFFF << 96;

/// Extracts the 16-bit short UUID if `uuid` is built on the base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
   let value = uuid.as_u128();
   if value & !SHORT_MASK != BASE_UUID {
      return None;
   }
   u16::try_from(value >> 96).ok()
}

/// Picks the audio profile a remote device is tracked under.
///
/// A2DP wins over the headset profiles since a device offering both is
/// tracked for its media stream.
pub fn classify_device<'a>(uuids: impl IntoIterator<Item = &'a Uuid>) -> Option<ProfileType> {
   let mut profile = None;
   for short in uuids.into_iter().filter_map(short_uuid) {
      match short {
         A2DP_SINK => return Some(ProfileType::A2dp),
         HSP_HS | HFP_HF => profile = Some(ProfileType::Headset),
         _ => {},
      }
   }
   profile
}

/// Classifies a media transport by its `UUID` property.
pub fn classify_transport(uuid: &str) -> RouteType {
   let short = Uuid::parse_str(uuid).ok().as_ref().and_then(short_uuid);
   match short {
      Some(A2DP_SINK) => RouteType::Bluetooth,
      Some(HSP_HS | HSP_AG | HFP_HF | HFP_AG) => RouteType::BluetoothCall,
      // A2DP source is a phone streaming to this host.
      _ => RouteType::Unknown,
   }
}

/// Profile a route type maps back to for connection events.
pub const fn route_profile(route_type: RouteType) -> Option<ProfileType> {
   match route_type {
      RouteType::Bluetooth => Some(ProfileType::A2dp),
      RouteType::BluetoothCall => Some(ProfileType::Headset),
      RouteType::Unknown => None,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   /// A2DP source role, offered by phones.
   const A2DP_SOURCE: u16 = 0x110A;

   fn full(short: u16) -> Uuid {
      Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))
   }

   #[test]
   fn test_short_uuid() {
      assert_eq!(short_uuid(&full(A2DP_SINK)), Some(0x110B));
      assert_eq!(
         short_uuid(&Uuid::parse_str("0000110b-0000-1000-8000-00805f9b34fb").unwrap()),
         Some(A2DP_SINK)
      );
      // Vendor UUID, not on the base
      assert_eq!(
         short_uuid(&Uuid::parse_str("74ec2172-0bad-4d01-8f77-997b2be0722a").unwrap()),
         None
      );
   }

   #[test]
   fn test_classify_device_prefers_a2dp() {
      let headphones = [full(HFP_HF), full(A2DP_SINK), full(HSP_HS)];
      assert_eq!(classify_device(&headphones), Some(ProfileType::A2dp));

      let headset = [full(HSP_HS)];
      assert_eq!(classify_device(&headset), Some(ProfileType::Headset));

      let phone = [full(A2DP_SOURCE), full(HFP_AG)];
      assert_eq!(classify_device(&phone), None);
   }

   #[test]
   fn test_classify_transport() {
      assert_eq!(
         classify_transport("0000110b-0000-1000-8000-00805f9b34fb"),
         RouteType::Bluetooth
      );
      assert_eq!(
         classify_transport("0000111f-0000-1000-8000-00805f9b34fb"),
         RouteType::BluetoothCall
      );
      assert_eq!(
         classify_transport("0000110a-0000-1000-8000-00805f9b34fb"),
         RouteType::Unknown
      );
      assert_eq!(classify_transport("garbage"), RouteType::Unknown);
   }
}
