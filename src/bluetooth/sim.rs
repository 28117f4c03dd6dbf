//! In-memory [`Adapter`] used by the test-suite and by the daemon when it
//! runs against a fixture file instead of a platform stack.
//!
//! Peripherals are described as enumeration entries plus, for every service
//! entry, an endpoint holding the GATT tree that opening its path exposes.
//! [`Faults`] lets callers make individual platform calls fail.

use std::{
   collections::HashMap,
   fs,
   path::{Path, PathBuf},
};

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;

use crate::{
   bluetooth::{
      Adapter, AdapterError, AdapterResult, Characteristic, Descriptor, DescriptorKind,
      DescriptorValue, EntryProperty, EventToken, FetchStatus, GattService, OsHandle, RawEntry,
      SubscriptionContext, ValueChangedCallback,
   },
   error::{BridgeError, Result},
   gatt::{
      directory::{DEVICE_PREFIX, SERVICE_PREFIX, endpoint_path},
      ids::AttrUuid,
   },
};

/// Uuid of the client characteristic configuration descriptor.
pub const CLIENT_CONFIGURATION_UUID: AttrUuid = AttrUuid::from_short(0x2902);

const INVALID_HANDLE: &str = "The handle is invalid.";

/// Failures to inject. `Option<String>` fields fail every call with that
/// message; counters fail the next `n` calls.
#[derive(Debug, Default)]
pub struct Faults {
   pub fail_enumerate: Option<String>,
   pub fail_property: Option<(EntryProperty, String)>,
   pub fail_open: Option<String>,
   pub fail_close: u32,
   pub fail_services: Option<String>,
   /// Reported instead of the endpoint's real service uuid.
   pub reported_service: Option<AttrUuid>,
   pub fail_characteristics: Option<String>,
   pub fail_value: Option<String>,
   /// Grows a characteristic value by this many bytes right after the first
   /// size query, so the second attempt is still too small.
   pub grow_value_once: usize,
   pub fail_write: Option<String>,
   pub fail_descriptors: Option<String>,
   pub fail_set_descriptor: Option<String>,
   pub fail_register: Option<String>,
   pub fail_unregister: u32,
}

/// A characteristic of a simulated endpoint.
#[derive(Debug, Clone)]
pub struct SimCharacteristic {
   pub characteristic: Characteristic,
   pub value: Vec<u8>,
   pub descriptors: Vec<Descriptor>,
}

impl SimCharacteristic {
   pub fn new(uuid: AttrUuid) -> Self {
      Self {
         characteristic: Characteristic {
            uuid,
            ..Default::default()
         },
         value: Vec::new(),
         descriptors: Vec::new(),
      }
   }

   pub fn readable(mut self, value: &[u8]) -> Self {
      self.characteristic.is_readable = true;
      self.value = value.to_vec();
      self
   }

   pub fn writable(mut self) -> Self {
      self.characteristic.is_writable = true;
      self.characteristic.is_writable_without_response = true;
      self
   }

   /// Marks the characteristic notifiable and gives it a client
   /// configuration descriptor.
   pub fn notifiable(mut self) -> Self {
      self.characteristic.is_notifiable = true;
      if !self
         .descriptors
         .iter()
         .any(|d| d.kind == DescriptorKind::ClientConfiguration)
      {
         self.descriptors.push(Descriptor {
            uuid: CLIENT_CONFIGURATION_UUID,
            kind: DescriptorKind::ClientConfiguration,
            attribute_handle: 0,
         });
      }
      self
   }

   pub fn without_client_configuration(mut self) -> Self {
      self
         .descriptors
         .retain(|d| d.kind != DescriptorKind::ClientConfiguration);
      self
   }
}

#[derive(Debug, Clone)]
struct SimEntry {
   hardware_id: String,
   container_id: String,
   name: String,
   instance_id: String,
}

#[derive(Debug, Clone, Default)]
struct SimEndpoint {
   service: GattService,
   characteristics: Vec<SimCharacteristic>,
}

struct Registration {
   context: SubscriptionContext,
   characteristic: AttrUuid,
   callback: ValueChangedCallback,
}

/// A write observed by the simulated stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWrite {
   pub characteristic: AttrUuid,
   pub value: Vec<u8>,
   pub with_response: bool,
}

#[derive(Default)]
struct SimState {
   entries: Vec<SimEntry>,
   endpoints: HashMap<String, SimEndpoint>,
   open: HashMap<u64, String>,
   next_handle: u64,
   close_calls: usize,
   registrations: HashMap<u64, Registration>,
   retired: Vec<ValueChangedCallback>,
   next_token: u64,
   writes: Vec<SimWrite>,
   descriptor_writes: Vec<(AttrUuid, DescriptorValue)>,
}

/// In-memory Bluetooth LE stack.
#[derive(Default)]
pub struct SimAdapter {
   state: Mutex<SimState>,
   faults: Mutex<Faults>,
}

impl SimAdapter {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn faults(&self) -> MutexGuard<'_, Faults> {
      self.faults.lock()
   }

   /// Adds an arbitrary enumeration entry.
   pub fn add_raw_entry(&self, hardware_id: &str, container_id: &str, name: &str, instance_id: &str) {
      self.state.lock().entries.push(SimEntry {
         hardware_id: hardware_id.to_owned(),
         container_id: container_id.to_owned(),
         name: name.to_owned(),
         instance_id: instance_id.to_owned(),
      });
   }

   /// Adds the entry of a physical peripheral.
   pub fn add_device_entry(&self, container_id: &str, name: &str) {
      let hardware_id = format!("{DEVICE_PREFIX}Dev_{}", container_id.trim_matches(&['{', '}'][..]));
      self.add_raw_entry(&hardware_id, container_id, name, &hardware_id);
   }

   /// Adds a service entry and the endpoint its path opens. `uuid_token` is
   /// the braced uuid as it appears in the hardware id. Returns the path.
   pub fn add_service_entry(&self, container_id: &str, uuid_token: &str, instance_id: &str) -> String {
      let hardware_id = format!("{SERVICE_PREFIX}{uuid_token}_Dev_VID&000000_PID&0000");
      self.add_raw_entry(&hardware_id, container_id, "Bluetooth LE Generic Attribute Service", instance_id);

      let path = endpoint_path(instance_id, uuid_token);
      if let Ok(uuid) = uuid_token.parse::<AttrUuid>() {
         self.state.lock().endpoints.insert(path.clone(), SimEndpoint {
            service: GattService {
               uuid,
               attribute_handle: 1,
            },
            characteristics: Vec::new(),
         });
      }
      path
   }

   /// Adds a characteristic to the endpoint at `path`.
   pub fn add_characteristic(&self, path: &str, mut characteristic: SimCharacteristic) {
      let mut state = self.state.lock();
      let Some(endpoint) = state.endpoints.get_mut(path) else {
         return;
      };
      let handle = 2 + 2 * endpoint.characteristics.len() as u16;
      characteristic.characteristic.service_handle = endpoint.service.attribute_handle;
      characteristic.characteristic.attribute_handle = handle;
      characteristic.characteristic.value_handle = handle + 1;
      endpoint.characteristics.push(characteristic);
   }

   /// Delivers a value change to every registration for `characteristic`,
   /// outside the state lock, the way a driver thread would.
   pub fn notify(&self, characteristic: AttrUuid, value: &[u8]) -> usize {
      let targets: Vec<_> = self
         .state
         .lock()
         .registrations
         .values()
         .filter(|r| r.characteristic == characteristic)
         .map(|r| (r.context, r.callback.clone()))
         .collect();
      for (context, callback) in &targets {
         callback(*context, value);
      }
      targets.len()
   }

   /// Invokes the most recently registered callback (live or retired) with
   /// an arbitrary context, as a late or confused driver would.
   pub fn notify_context(&self, context: SubscriptionContext, value: &[u8]) -> bool {
      let callback = {
         let state = self.state.lock();
         state
            .registrations
            .values()
            .map(|r| r.callback.clone())
            .next()
            .or_else(|| state.retired.last().cloned())
      };
      match callback {
         Some(callback) => {
            callback(context, value);
            true
         },
         None => false,
      }
   }

   pub fn open_handles(&self) -> usize {
      self.state.lock().open.len()
   }

   pub fn close_calls(&self) -> usize {
      self.state.lock().close_calls
   }

   pub fn registrations(&self) -> usize {
      self.state.lock().registrations.len()
   }

   pub fn writes(&self) -> Vec<SimWrite> {
      self.state.lock().writes.clone()
   }

   pub fn descriptor_writes(&self) -> Vec<(AttrUuid, DescriptorValue)> {
      self.state.lock().descriptor_writes.clone()
   }

   /// Builds an adapter from a TOML fixture file.
   pub fn from_fixture(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      let fixture: Fixture = toml::from_str(&contents)?;
      let adapter = Self::new();
      fixture.install(&adapter).map_err(|reason| BridgeError::Fixture {
         path: PathBuf::from(path),
         reason,
      })?;
      Ok(adapter)
   }

   fn endpoint_of<'a>(state: &'a SimState, handle: &OsHandle) -> AdapterResult<&'a SimEndpoint> {
      state
         .open
         .get(&handle.0)
         .and_then(|path| state.endpoints.get(path))
         .ok_or_else(|| AdapterError::failed(INVALID_HANDLE))
   }

   fn characteristic_of<'a>(
      state: &'a SimState,
      handle: &OsHandle,
      characteristic: &Characteristic,
   ) -> AdapterResult<&'a SimCharacteristic> {
      Self::endpoint_of(state, handle)?
         .characteristics
         .iter()
         .find(|c| c.characteristic.uuid == characteristic.uuid)
         .ok_or_else(|| AdapterError::failed("Element not found."))
   }
}

fn fail_with(fault: &Option<String>) -> AdapterResult<()> {
   match fault {
      Some(message) => Err(AdapterError::failed(message.clone())),
      None => Ok(()),
   }
}

fn fill<T: Clone>(items: &[T], buf: &mut [T]) -> FetchStatus {
   if buf.len() < items.len() {
      return FetchStatus::MoreData(items.len());
   }
   buf[..items.len()].clone_from_slice(items);
   FetchStatus::Complete(items.len())
}

macro_rules! try_fetch {
   ($e:expr) => {
      match $e {
         Ok(v) => v,
         Err(e) => return FetchStatus::Failed(e),
      }
   };
}

impl Adapter for SimAdapter {
   fn enumerate_entries(&self) -> AdapterResult<Vec<RawEntry>> {
      fail_with(&self.faults.lock().fail_enumerate)?;
      let count = self.state.lock().entries.len();
      Ok((0..count as u32).map(RawEntry).collect())
   }

   fn read_entry_property(&self, entry: RawEntry, property: EntryProperty) -> AdapterResult<String> {
      if let Some((failing, message)) = &self.faults.lock().fail_property
         && *failing == property
      {
         return Err(AdapterError::failed(message.clone()));
      }
      let state = self.state.lock();
      let entry = state
         .entries
         .get(entry.0 as usize)
         .ok_or_else(|| AdapterError::failed("No more data is available."))?;
      Ok(match property {
         EntryProperty::HardwareId => entry.hardware_id.clone(),
         EntryProperty::ContainerId => entry.container_id.clone(),
         EntryProperty::FriendlyName | EntryProperty::DeviceDescription => entry.name.clone(),
      })
   }

   fn read_entry_instance_id(&self, entry: RawEntry) -> AdapterResult<String> {
      self
         .state
         .lock()
         .entries
         .get(entry.0 as usize)
         .map(|e| e.instance_id.clone())
         .ok_or_else(|| AdapterError::failed("No more data is available."))
   }

   fn open_endpoint(&self, path: &str) -> AdapterResult<OsHandle> {
      fail_with(&self.faults.lock().fail_open)?;
      let mut state = self.state.lock();
      if !state.endpoints.contains_key(path) {
         return Err(AdapterError::failed("The system cannot find the file specified."));
      }
      state.next_handle += 1;
      let handle = state.next_handle;
      state.open.insert(handle, path.to_owned());
      debug!("sim: opened {path} as handle {handle}");
      Ok(OsHandle(handle))
   }

   fn close_endpoint(&self, handle: &OsHandle) -> AdapterResult<()> {
      {
         let mut faults = self.faults.lock();
         if faults.fail_close > 0 {
            faults.fail_close -= 1;
            return Err(AdapterError::failed("The device is busy."));
         }
      }
      let mut state = self.state.lock();
      state.close_calls += 1;
      match state.open.remove(&handle.0) {
         Some(_) => Ok(()),
         None => Err(AdapterError::failed(INVALID_HANDLE)),
      }
   }

   fn fetch_services(&self, handle: &OsHandle, buf: &mut [GattService]) -> FetchStatus {
      try_fetch!(fail_with(&self.faults.lock().fail_services));
      let reported = self.faults.lock().reported_service;
      let state = self.state.lock();
      let mut service = try_fetch!(Self::endpoint_of(&state, handle)).service;
      if let Some(uuid) = reported {
         service.uuid = uuid;
      }
      fill(&[service], buf)
   }

   fn fetch_characteristics(
      &self,
      handle: &OsHandle,
      service: &GattService,
      buf: &mut [Characteristic],
   ) -> FetchStatus {
      try_fetch!(fail_with(&self.faults.lock().fail_characteristics));
      let state = self.state.lock();
      let endpoint = try_fetch!(Self::endpoint_of(&state, handle));
      let items: Vec<Characteristic> = endpoint
         .characteristics
         .iter()
         .map(|c| c.characteristic)
         .filter(|c| c.service_handle == service.attribute_handle)
         .collect();
      fill(&items, buf)
   }

   fn fetch_characteristic_value(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      buf: &mut [u8],
   ) -> FetchStatus {
      if !characteristic.is_readable {
         return FetchStatus::Failed(AdapterError::NotReadable);
      }
      try_fetch!(fail_with(&self.faults.lock().fail_value));
      let mut state = self.state.lock();
      let value = try_fetch!(Self::characteristic_of(&state, handle, characteristic))
         .value
         .clone();
      let status = fill(&value, buf);

      let mut faults = self.faults.lock();
      if matches!(status, FetchStatus::MoreData(_)) && faults.grow_value_once > 0 {
         let grow = std::mem::take(&mut faults.grow_value_once);
         if let Some(path) = state.open.get(&handle.0).cloned()
            && let Some(endpoint) = state.endpoints.get_mut(&path)
            && let Some(sim) = endpoint
               .characteristics
               .iter_mut()
               .find(|c| c.characteristic.uuid == characteristic.uuid)
         {
            sim.value.extend(std::iter::repeat_n(0xEE, grow));
         }
      }
      status
   }

   fn set_characteristic_value(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      value: &[u8],
      with_response: bool,
   ) -> AdapterResult<()> {
      fail_with(&self.faults.lock().fail_write)?;
      let mut state = self.state.lock();
      Self::characteristic_of(&state, handle, characteristic)?;
      state.writes.push(SimWrite {
         characteristic: characteristic.uuid,
         value: value.to_vec(),
         with_response,
      });
      Ok(())
   }

   fn fetch_descriptors(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      buf: &mut [Descriptor],
   ) -> FetchStatus {
      try_fetch!(fail_with(&self.faults.lock().fail_descriptors));
      let state = self.state.lock();
      let sim = try_fetch!(Self::characteristic_of(&state, handle, characteristic));
      fill(&sim.descriptors, buf)
   }

   fn set_descriptor_value(
      &self,
      handle: &OsHandle,
      descriptor: &Descriptor,
      value: DescriptorValue,
   ) -> AdapterResult<()> {
      fail_with(&self.faults.lock().fail_set_descriptor)?;
      let mut state = self.state.lock();
      Self::endpoint_of(&state, handle)?;
      state.descriptor_writes.push((descriptor.uuid, value));
      Ok(())
   }

   fn register_value_changed(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      context: SubscriptionContext,
      callback: ValueChangedCallback,
   ) -> AdapterResult<EventToken> {
      fail_with(&self.faults.lock().fail_register)?;
      let mut state = self.state.lock();
      Self::characteristic_of(&state, handle, characteristic)?;
      state.next_token += 1;
      let token = state.next_token;
      state.registrations.insert(token, Registration {
         context,
         characteristic: characteristic.uuid,
         callback,
      });
      Ok(EventToken(token))
   }

   fn unregister_callback(&self, token: &EventToken) -> AdapterResult<()> {
      {
         let mut faults = self.faults.lock();
         if faults.fail_unregister > 0 {
            faults.fail_unregister -= 1;
            return Err(AdapterError::failed("The request is not supported."));
         }
      }
      let mut state = self.state.lock();
      let registration = state
         .registrations
         .remove(&token.0)
         .ok_or_else(|| AdapterError::failed(INVALID_HANDLE))?;
      state.retired.push(registration.callback);
      Ok(())
   }
}

// === Fixture files ===

#[derive(Debug, Deserialize)]
struct Fixture {
   #[serde(default, rename = "peripheral")]
   peripherals: Vec<FixturePeripheral>,
}

#[derive(Debug, Deserialize)]
struct FixturePeripheral {
   container_id: String,
   name: String,
   #[serde(default, rename = "service")]
   services: Vec<FixtureService>,
}

#[derive(Debug, Deserialize)]
struct FixtureService {
   uuid: String,
   instance_id: String,
   #[serde(default, rename = "characteristic")]
   characteristics: Vec<FixtureCharacteristic>,
}

#[derive(Debug, Deserialize)]
struct FixtureCharacteristic {
   uuid: String,
   /// Initial value, hex encoded.
   #[serde(default)]
   value: Option<String>,
   #[serde(default)]
   write: bool,
   #[serde(default)]
   notify: bool,
}

impl Fixture {
   fn install(self, adapter: &SimAdapter) -> std::result::Result<(), String> {
      for peripheral in self.peripherals {
         adapter.add_device_entry(&peripheral.container_id, &peripheral.name);
         for service in peripheral.services {
            let uuid: AttrUuid = service
               .uuid
               .parse()
               .map_err(|e| format!("service uuid '{}': {e}", service.uuid))?;
            let token = format!("{{{uuid}}}");
            let path = adapter.add_service_entry(&peripheral.container_id, &token, &service.instance_id);

            for fc in service.characteristics {
               let uuid: AttrUuid = fc
                  .uuid
                  .parse()
                  .map_err(|e| format!("characteristic uuid '{}': {e}", fc.uuid))?;
               let mut sim = SimCharacteristic::new(uuid);
               if let Some(value) = fc.value {
                  let bytes = hex::decode(&value).map_err(|e| format!("value of {uuid}: {e}"))?;
                  sim = sim.readable(&bytes);
               }
               if fc.write {
                  sim = sim.writable();
               }
               if fc.notify {
                  sim = sim.notifiable();
               }
               adapter.add_characteristic(&path, sim);
            }
         }
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use std::io::Write;

   use super::*;

   #[test]
   fn test_fixture_builds_entries_and_endpoints() {
      let mut file = tempfile::NamedTempFile::new().unwrap();
      write!(
         file,
         r#"
[[peripheral]]
container_id = "{{11111111-2222-3333-4444-555555555555}}"
name = "Sensor"

[[peripheral.service]]
uuid = "180F"
instance_id = 'BTHLEDEVICE\{{0000180F}}_Dev\7&1'

[[peripheral.service.characteristic]]
uuid = "2A19"
value = "64"
notify = true
"#
      )
      .unwrap();

      let adapter = SimAdapter::from_fixture(file.path()).unwrap();
      assert_eq!(adapter.enumerate_entries().unwrap().len(), 2);

      let path = endpoint_path(
         r"BTHLEDEVICE\{0000180F}_Dev\7&1",
         "{0000180F-0000-1000-8000-00805F9B34FB}",
      );
      let handle = adapter.open_endpoint(&path).unwrap();
      let mut buf = [Characteristic::default(); 4];
      let service = GattService {
         uuid: AttrUuid::from_short(0x180F),
         attribute_handle: 1,
      };
      assert_eq!(
         adapter.fetch_characteristics(&handle, &service, &mut buf),
         FetchStatus::Complete(1)
      );
      assert!(buf[0].is_readable && buf[0].is_notifiable && !buf[0].is_writable);
      adapter.close_endpoint(&handle).unwrap();
      assert_eq!(adapter.open_handles(), 0);
   }

   #[test]
   fn test_fixture_rejects_bad_uuid() {
      let mut file = tempfile::NamedTempFile::new().unwrap();
      write!(
         file,
         r#"
[[peripheral]]
container_id = "{{11111111-2222-3333-4444-555555555555}}"
name = "Sensor"

[[peripheral.service]]
uuid = "not-a-uuid"
instance_id = 'X\1'
"#
      )
      .unwrap();

      assert!(matches!(
         SimAdapter::from_fixture(file.path()),
         Err(BridgeError::Fixture { .. })
      ));
   }
}
