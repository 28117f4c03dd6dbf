//! Identifier codec.
//!
//! Peripherals are keyed by their platform container id (a GUID), services
//! and characteristics by their attribute UUID. Both travel to the host as
//! canonical strings; this module owns the conversion in both directions.

use std::{fmt, str::FromStr};

use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::BridgeError;

/// Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Container id grouping a physical peripheral with all its service entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContainerId(Uuid);

impl ContainerId {
   pub const fn new(uuid: Uuid) -> Self {
      Self(uuid)
   }

   pub const fn as_uuid(&self) -> &Uuid {
      &self.0
   }
}

impl fmt::Display for ContainerId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.0.braced().encode_upper(&mut Uuid::encode_buffer()))
   }
}

impl FromStr for ContainerId {
   type Err = BridgeError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let s = s.trim();
      if s.is_empty() {
         return Err(BridgeError::missing("address"));
      }
      Uuid::parse_str(s)
         .map(Self)
         .map_err(|e| BridgeError::InvalidArgument {
            what: "address",
            reason: format!("'{s}': {e}"),
         })
   }
}

/// GATT attribute UUID of a service, characteristic or descriptor.
///
/// 16 and 32-bit short forms are stored expanded against the base UUID so
/// that `180F` and `0000180F-0000-1000-8000-00805F9B34FB` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttrUuid(Uuid);

impl AttrUuid {
   pub const fn new(uuid: Uuid) -> Self {
      Self(uuid)
   }

   pub const fn from_short(short: u32) -> Self {
      Self(Uuid::from_u128(BASE_UUID | ((short as u128) << 96)))
   }

   pub const fn as_uuid(&self) -> &Uuid {
      &self.0
   }

   /// Returns the 16/32-bit alias if this UUID lives in the base range.
   pub fn short(&self) -> Option<u32> {
      let raw = self.0.as_u128();
      if raw & ((1u128 << 96) - 1) == BASE_UUID {
         Some((raw >> 96) as u32)
      } else {
         None
      }
   }

   /// Parses a UUID coming from the host; `what` names the argument in errors.
   pub fn parse_arg(s: &str, what: &'static str) -> Result<Self, BridgeError> {
      let s = s.trim();
      if s.is_empty() {
         return Err(BridgeError::missing(what));
      }
      s.parse().map_err(|reason| BridgeError::InvalidArgument {
         what,
         reason: format!("'{s}': {reason}"),
      })
   }
}

impl fmt::Display for AttrUuid {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.0.hyphenated().encode_upper(&mut Uuid::encode_buffer()))
   }
}

impl FromStr for AttrUuid {
   type Err = String;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let s = s.trim();
      let bare = s
         .strip_prefix('{')
         .and_then(|s| s.strip_suffix('}'))
         .unwrap_or(s);
      let bare = bare
         .strip_prefix("0x")
         .or_else(|| bare.strip_prefix("0X"))
         .unwrap_or(bare);
      if matches!(bare.len(), 4 | 8) {
         return u32::from_str_radix(bare, 16)
            .map(Self::from_short)
            .map_err(|e| e.to_string());
      }
      Uuid::parse_str(s).map(Self).map_err(|e| e.to_string())
   }
}

impl From<Uuid> for AttrUuid {
   fn from(uuid: Uuid) -> Self {
      Self(uuid)
   }
}

/// Filter list of service UUIDs as sent by the host.
pub type UuidList = SmallVec<[AttrUuid; 4]>;

/// Parses a host supplied list of UUIDs separated by `|`, `,`, `;` or
/// whitespace. Empty items are skipped.
pub fn parse_uuid_list(list: &str) -> Result<UuidList, BridgeError> {
   list
      .split(|c: char| matches!(c, '|' | ',' | ';') || c.is_whitespace())
      .filter(|item| !item.is_empty())
      .map(|item| AttrUuid::parse_arg(item, "service uuid"))
      .collect()
}

/// Extracts the first `{...}` token from a platform hardware id.
///
/// Returns the token including its braces, which is how it appears in the
/// endpoint path.
pub fn extract_braced_token(hardware_id: &str) -> Option<&str> {
   let start = hardware_id.find('{')?;
   let len = hardware_id[start..].find('}')?;
   Some(&hardware_id[start..=start + len])
}

#[cfg(test)]
mod tests {
   use super::*;

   const BATTERY: &str = "0000180F-0000-1000-8000-00805F9B34FB";

   #[test]
   fn test_short_forms_expand_to_base_uuid() {
      let short: AttrUuid = "180F".parse().unwrap();
      let long: AttrUuid = BATTERY.parse().unwrap();
      let braced: AttrUuid = "{0000180f-0000-1000-8000-00805f9b34fb}".parse().unwrap();

      assert_eq!(short, long);
      assert_eq!(short, braced);
      assert_eq!(short.short(), Some(0x180F));
      assert_eq!(short.to_string(), BATTERY);
      assert_eq!(AttrUuid::from_short(0x2A19).to_string(), "00002A19-0000-1000-8000-00805F9B34FB");
   }

   #[test]
   fn test_vendor_uuid_has_no_short_alias() {
      let vendor: AttrUuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
      assert_eq!(vendor.short(), None);
      assert_eq!(vendor.to_string(), "6E400001-B5A3-F393-E0A9-E50E24DCCA9E");
   }

   #[test]
   fn test_container_id_round_trips_braced_upper() {
      let id: ContainerId = "a1b2c3d4-0000-1111-2222-333344445555".parse().unwrap();
      assert_eq!(id.to_string(), "{A1B2C3D4-0000-1111-2222-333344445555}");
      assert_eq!(id.to_string().parse::<ContainerId>().unwrap(), id);
   }

   #[test]
   fn test_container_id_rejects_empty_and_garbage() {
      assert!(matches!(
         "".parse::<ContainerId>(),
         Err(BridgeError::InvalidArgument { what: "address", .. })
      ));
      assert!(matches!(
         "not-a-guid".parse::<ContainerId>(),
         Err(BridgeError::InvalidArgument { what: "address", .. })
      ));
   }

   #[test]
   fn test_parse_uuid_list_separators() {
      let list = parse_uuid_list("180F|180A, 6e400001-b5a3-f393-e0a9-e50e24dcca9e ;").unwrap();
      assert_eq!(list.len(), 3);
      assert_eq!(list[0], AttrUuid::from_short(0x180F));
      assert_eq!(list[1], AttrUuid::from_short(0x180A));

      assert!(parse_uuid_list("").unwrap().is_empty());
      assert!(parse_uuid_list("180F|zz").is_err());
   }

   #[test]
   fn test_extract_braced_token() {
      let hwid = r"BTHLEDevice\{0000180f-0000-1000-8000-00805f9b34fb}_Dev_VID&02000d_PID&0001";
      assert_eq!(
         extract_braced_token(hwid),
         Some("{0000180f-0000-1000-8000-00805f9b34fb}")
      );
      assert_eq!(extract_braced_token(r"BTHLEDevice\{a}{b}"), Some("{a}"));
      assert_eq!(extract_braced_token(r"BTHLEDevice\no_token"), None);
      assert_eq!(extract_braced_token(r"BTHLEDevice\{unterminated"), None);
   }
}
