//! Platform Bluetooth boundary.
//!
//! The core never talks to an OS API directly. Everything it needs from
//! the platform stack goes through the [`Adapter`] trait defined here, and
//! every variable-length attribute read goes through [`fetch::fetch`].

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::gatt::ids::AttrUuid;

pub mod fetch;
pub mod manager;
pub mod sim;

/// Error reported by the platform stack. The message is passed through to
/// the host verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
   #[error("{0}")]
   Failed(String),

   #[error("attribute is not readable")]
   NotReadable,
}

impl AdapterError {
   pub fn failed(message: impl Into<String>) -> Self {
      Self::Failed(message.into())
   }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Outcome of one variable-length call against a caller supplied buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
   /// The buffer held everything; the first `n` elements are valid.
   Complete(usize),
   /// The buffer is too small; `n` elements are required.
   MoreData(usize),
   Failed(AdapterError),
}

/// One raw entry of the platform device enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEntry(pub u32);

/// Properties the directory reads from an enumeration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum EntryProperty {
   #[strum(serialize = "hardware id")]
   HardwareId,
   #[strum(serialize = "container id")]
   ContainerId,
   #[strum(serialize = "friendly name")]
   FriendlyName,
   #[strum(serialize = "device description")]
   DeviceDescription,
}

/// OS handle to an opened service endpoint. Not `Clone`: whoever holds it
/// is responsible for closing it exactly once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct OsHandle(pub u64);

/// Token of a value-changed registration. Not `Clone`, see [`OsHandle`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EventToken(pub u64);

/// Opaque context handed to the adapter with a value-changed registration
/// and handed back on every notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionContext(pub u64);

impl fmt::Display for SubscriptionContext {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// GATT service descriptor as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GattService {
   pub uuid: AttrUuid,
   pub attribute_handle: u16,
}

/// GATT characteristic descriptor with its capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Characteristic {
   pub service_handle: u16,
   pub uuid: AttrUuid,
   pub attribute_handle: u16,
   pub value_handle: u16,
   pub is_readable: bool,
   pub is_writable: bool,
   pub is_writable_without_response: bool,
   pub is_notifiable: bool,
   pub is_indicatable: bool,
}

/// Descriptor kinds the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescriptorKind {
   ClientConfiguration,
   #[default]
   Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
   pub uuid: AttrUuid,
   pub kind: DescriptorKind,
   pub attribute_handle: u16,
}

/// Value written to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorValue {
   ClientConfiguration {
      subscribe_to_notification: bool,
      subscribe_to_indication: bool,
   },
}

impl DescriptorValue {
   pub const ENABLE_NOTIFICATION: Self = Self::ClientConfiguration {
      subscribe_to_notification: true,
      subscribe_to_indication: false,
   };
}

/// Callback invoked by the adapter, on any thread, when a registered
/// characteristic changes value.
pub type ValueChangedCallback = Arc<dyn Fn(SubscriptionContext, &[u8]) + Send + Sync>;

/// Capability interface of the platform Bluetooth LE stack.
///
/// All calls are synchronous and may block the calling thread for the
/// duration of the platform round-trip.
pub trait Adapter: Send + Sync {
   fn enumerate_entries(&self) -> AdapterResult<Vec<RawEntry>>;

   fn read_entry_property(&self, entry: RawEntry, property: EntryProperty) -> AdapterResult<String>;

   fn read_entry_instance_id(&self, entry: RawEntry) -> AdapterResult<String>;

   fn open_endpoint(&self, path: &str) -> AdapterResult<OsHandle>;

   fn close_endpoint(&self, handle: &OsHandle) -> AdapterResult<()>;

   fn fetch_services(&self, handle: &OsHandle, buf: &mut [GattService]) -> FetchStatus;

   fn fetch_characteristics(
      &self,
      handle: &OsHandle,
      service: &GattService,
      buf: &mut [Characteristic],
   ) -> FetchStatus;

   /// Fails fast with [`AdapterError::NotReadable`] when the characteristic
   /// lacks the read capability.
   fn fetch_characteristic_value(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      buf: &mut [u8],
   ) -> FetchStatus;

   fn set_characteristic_value(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      value: &[u8],
      with_response: bool,
   ) -> AdapterResult<()>;

   fn fetch_descriptors(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      buf: &mut [Descriptor],
   ) -> FetchStatus;

   fn set_descriptor_value(
      &self,
      handle: &OsHandle,
      descriptor: &Descriptor,
      value: DescriptorValue,
   ) -> AdapterResult<()>;

   fn register_value_changed(
      &self,
      handle: &OsHandle,
      characteristic: &Characteristic,
      context: SubscriptionContext,
      callback: ValueChangedCallback,
   ) -> AdapterResult<EventToken>;

   fn unregister_callback(&self, token: &EventToken) -> AdapterResult<()>;
}
