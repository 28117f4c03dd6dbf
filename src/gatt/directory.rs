//! Directory of discovered peripherals and their GATT services.
//!
//! The platform reports a physical peripheral and each of its services as
//! separate, unordered enumeration entries. The container id is the only
//! stable join key, so discovery is two passes: collect everything, then
//! link services to devices.

use log::{debug, info};
use smol_str::SmolStr;

use crate::{
   bluetooth::{Adapter, EntryProperty, RawEntry},
   error::{BridgeError, Result},
   event::EventQueue,
   gatt::ids::{AttrUuid, ContainerId, extract_braced_token},
};

/// Hardware id prefix of a peripheral entry.
pub const DEVICE_PREFIX: &str = "BTHLE\\";
/// Hardware id prefix of a GATT service entry.
pub const SERVICE_PREFIX: &str = "BTHLEDevice\\";
/// Prefix of every endpoint path.
pub const PATH_PREFIX: &str = "\\\\?\\";
/// Replaces path separators of the instance id inside an endpoint path.
pub const PATH_DELIMITER: char = '#';

/// A discovered physical peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
   pub id: ContainerId,
   pub name: SmolStr,
}

/// A discovered GATT service of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
   pub container_id: ContainerId,
   pub uuid: AttrUuid,
   pub name: SmolStr,
   /// Endpoint path the connection manager opens.
   pub path: String,
   /// Owning device, resolved by [`Directory::link_services_to_devices`].
   pub device: Option<ContainerId>,
}

impl Service {
   pub const fn key(&self) -> ServiceKey {
      ServiceKey {
         device: self.container_id,
         service: self.uuid,
      }
   }
}

/// Identity of a service: `(container id, uuid)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
   pub device: ContainerId,
   pub service: AttrUuid,
}

/// Identity of a characteristic on a connected service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicKey {
   pub device: ContainerId,
   pub service: AttrUuid,
   pub characteristic: AttrUuid,
}

impl CharacteristicKey {
   pub const fn service_key(&self) -> ServiceKey {
      ServiceKey {
         device: self.device,
         service: self.service,
      }
   }
}

/// Counts of records added by one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
   pub devices_added: usize,
   pub services_added: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
   Device,
   Service,
}

impl EntryKind {
   fn classify(hardware_id: &str) -> Option<Self> {
      if hardware_id.starts_with(DEVICE_PREFIX) {
         Some(Self::Device)
      } else if hardware_id.starts_with(SERVICE_PREFIX) {
         Some(Self::Service)
      } else {
         None
      }
   }
}

/// Builds the endpoint path of a service from its entry's instance id and
/// the braced uuid token of its hardware id.
pub fn endpoint_path(instance_id: &str, token: &str) -> String {
   let mut path = String::with_capacity(PATH_PREFIX.len() + instance_id.len() + token.len() + 1);
   path.push_str(PATH_PREFIX);
   path.extend(
      instance_id
         .chars()
         .map(|c| if c == '\\' { PATH_DELIMITER } else { c }),
   );
   path.push(PATH_DELIMITER);
   path.push_str(token);
   path
}

/// Owner of every discovered device and service.
#[derive(Debug, Default)]
pub struct Directory {
   devices: Vec<Device>,
   services: Vec<Service>,
}

impl Directory {
   pub fn new() -> Self {
      Self::default()
   }

   /// Enumerates platform entries and records new devices and services.
   ///
   /// Rediscovering a known container id or `(container id, uuid)` pair is a
   /// no-op. Per-entry failures are reported and skip only that entry.
   pub fn scan(&mut self, adapter: &dyn Adapter, events: &EventQueue) -> ScanSummary {
      let mut summary = ScanSummary::default();

      let entries = match adapter.enumerate_entries() {
         Ok(entries) => entries,
         Err(e) => {
            events.report(&BridgeError::os_api(
               "Could not request bluetooth device list",
               e,
            ));
            return summary;
         },
      };
      debug!("Enumerated {} bluetooth entries", entries.len());

      for entry in entries {
         match self.scan_entry(adapter, events, entry) {
            Ok(Some(EntryKind::Device)) => summary.devices_added += 1,
            Ok(Some(EntryKind::Service)) => summary.services_added += 1,
            Ok(None) => {},
            Err(e) => events.report(&e),
         }
      }

      if summary != ScanSummary::default() {
         info!(
            "Scan added {} devices and {} services",
            summary.devices_added, summary.services_added
         );
      }
      summary
   }

   /// Records one entry. Returns the kind of record added, if any.
   fn scan_entry(
      &mut self,
      adapter: &dyn Adapter,
      events: &EventQueue,
      entry: RawEntry,
   ) -> Result<Option<EntryKind>> {
      let hardware_id = read_property(adapter, entry, EntryProperty::HardwareId)?;
      let Some(kind) = EntryKind::classify(&hardware_id) else {
         return Ok(None);
      };

      let container_id: ContainerId = read_property(adapter, entry, EntryProperty::ContainerId)?
         .parse()
         .map_err(|e| BridgeError::os_api("Could not read device container id", e))?;

      match kind {
         EntryKind::Device => {
            if self.device(container_id).is_some() {
               return Ok(None);
            }
            let name = display_property(adapter, events, entry, EntryProperty::FriendlyName);
            debug!("Discovered device {container_id} '{name}'");
            self.devices.push(Device {
               id: container_id,
               name,
            });
         },
         EntryKind::Service => {
            let token = extract_braced_token(&hardware_id).ok_or_else(|| {
               BridgeError::os_api(
                  "Could not extract service GUID",
                  format!("hardware id '{hardware_id}' has no {{...}} token"),
               )
            })?;
            let uuid = AttrUuid::parse_arg(token, "service uuid")?;
            if self.service(container_id, uuid).is_some() {
               return Ok(None);
            }

            let instance_id = adapter
               .read_entry_instance_id(entry)
               .map_err(|e| BridgeError::os_api("Could not read device instance Id", e))?;
            let name = display_property(adapter, events, entry, EntryProperty::DeviceDescription);
            let path = endpoint_path(&instance_id, token);
            debug!("Discovered service {uuid} of {container_id} at {path}");
            self.services.push(Service {
               container_id,
               uuid,
               name,
               path,
               device: None,
            });
         },
      }
      Ok(Some(kind))
   }

   /// Resolves each service's owning device by container id. Services with
   /// no matching device are reported and stay unresolved.
   pub fn link_services_to_devices(&mut self, events: &EventQueue) {
      for service in &mut self.services {
         if self.devices.iter().any(|d| d.id == service.container_id) {
            service.device = Some(service.container_id);
         } else {
            service.device = None;
            events.report(&BridgeError::not_found(format!(
               "the device that service {} belongs to",
               service.uuid
            )));
         }
      }
   }

   pub fn find_services_matching<'a>(
      &'a self,
      uuids: &'a [AttrUuid],
   ) -> impl Iterator<Item = &'a Service> + 'a {
      self.services.iter().filter(|s| uuids.contains(&s.uuid))
   }

   pub fn device(&self, id: ContainerId) -> Option<&Device> {
      self.devices.iter().find(|d| d.id == id)
   }

   pub fn service(&self, container_id: ContainerId, uuid: AttrUuid) -> Option<&Service> {
      self
         .services
         .iter()
         .find(|s| s.container_id == container_id && s.uuid == uuid)
   }

   pub fn services_for(&self, id: ContainerId) -> impl Iterator<Item = &Service> + '_ {
      self.services.iter().filter(move |s| s.container_id == id)
   }

   pub fn devices(&self) -> &[Device] {
      &self.devices
   }

   pub fn services(&self) -> &[Service] {
      &self.services
   }

   pub fn clear_devices(&mut self) {
      self.devices.clear();
   }

   pub fn clear(&mut self) {
      self.devices.clear();
      self.services.clear();
   }
}

fn read_property(adapter: &dyn Adapter, entry: RawEntry, property: EntryProperty) -> Result<String> {
   adapter
      .read_entry_property(entry, property)
      .map_err(|e| BridgeError::os_api(format!("Could not read device {property}"), e))
}

/// Reads a name-like property; failures are reported and yield an empty name.
fn display_property(
   adapter: &dyn Adapter,
   events: &EventQueue,
   entry: RawEntry,
   property: EntryProperty,
) -> SmolStr {
   match read_property(adapter, entry, property) {
      Ok(value) => value.into(),
      Err(e) => {
         events.report(&e);
         SmolStr::default()
      },
   }
}
