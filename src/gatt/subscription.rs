//! Value-change subscriptions.
//!
//! Each subscription is tagged with a [`SubscriptionContext`] that is handed
//! to the adapter at registration. Value changes arrive on adapter threads
//! carrying only that context, and are resolved against [`LiveIndex`]; the
//! registry itself lives behind the host lock and is never touched from a
//! callback.

use std::{
   collections::HashMap,
   sync::{Arc, Weak},
};

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::{
   bluetooth::{
      Adapter, Characteristic, DescriptorKind, DescriptorValue, EventToken, SubscriptionContext,
      ValueChangedCallback, fetch::fetch, manager::ConnectionManager,
   },
   error::{BridgeError, Result},
   event::{BleEvent, EventQueue, EventSender},
   gatt::{
      directory::{CharacteristicKey, ServiceKey},
      ids::{AttrUuid, ContainerId},
   },
};

/// An active notification registration.
#[derive(Debug)]
pub struct Subscription {
   pub key: CharacteristicKey,
   pub characteristic: Characteristic,
   pub context: SubscriptionContext,
   token: EventToken,
}

#[derive(Debug, Clone, Copy)]
struct LiveEntry {
   device: ContainerId,
   characteristic: AttrUuid,
}

/// Contexts that may currently receive value changes.
#[derive(Debug, Default)]
pub struct LiveIndex {
   entries: RwLock<HashMap<SubscriptionContext, LiveEntry>>,
}

impl LiveIndex {
   fn publish(&self, context: SubscriptionContext, key: CharacteristicKey) {
      self.entries.write().insert(context, LiveEntry {
         device: key.device,
         characteristic: key.characteristic,
      });
   }

   fn withdraw(&self, context: SubscriptionContext) {
      self.entries.write().remove(&context);
   }

   pub fn contains(&self, context: SubscriptionContext) -> bool {
      self.entries.read().contains_key(&context)
   }

   pub fn len(&self) -> usize {
      self.entries.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Handles a value change delivered by the adapter.
   ///
   /// Contexts that were withdrawn (or never published) are reported and
   /// the value is dropped.
   pub fn on_value_changed(&self, events: &EventQueue, context: SubscriptionContext, value: &[u8]) {
      let entry = self.entries.read().get(&context).copied();
      match entry {
         Some(entry) => {
            debug!("{context} {}: {}", entry.characteristic, hex::encode(value));
            events.send(BleEvent::DidUpdateValueForCharacteristic {
               device: entry.device,
               characteristic: entry.characteristic,
               value: value.to_vec(),
            });
         },
         None => events.report(&BridgeError::not_found(format!(
            "notification registration {context} for a received value"
         ))),
      }
   }
}

/// Builds the callback handed to the adapter. It holds weak references only,
/// so a callback outliving the session drops the value.
fn notifier(live: &Arc<LiveIndex>, events: &EventSender) -> ValueChangedCallback {
   let live: Weak<LiveIndex> = Arc::downgrade(live);
   let events: Weak<EventQueue> = Arc::downgrade(events);
   Arc::new(move |context: SubscriptionContext, value: &[u8]| {
      match (live.upgrade(), events.upgrade()) {
         (Some(live), Some(events)) => live.on_value_changed(&events, context, value),
         _ => debug!("Dropping value for {context}: session is gone"),
      }
   })
}

/// Owner of all subscriptions of a session.
pub struct SubscriptionRegistry {
   records: Vec<Subscription>,
   live: Arc<LiveIndex>,
   callback: ValueChangedCallback,
   next_context: u64,
}

impl std::fmt::Debug for SubscriptionRegistry {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SubscriptionRegistry")
         .field("records", &self.records)
         .field("live", &self.live)
         .field("next_context", &self.next_context)
         .finish_non_exhaustive()
   }
}

impl SubscriptionRegistry {
   pub fn new(events: &EventSender) -> Self {
      let live = Arc::new(LiveIndex::default());
      Self {
         callback: notifier(&live, events),
         live,
         records: Vec::new(),
         next_context: 0,
      }
   }

   pub fn live(&self) -> &Arc<LiveIndex> {
      &self.live
   }

   pub fn find(&self, key: CharacteristicKey) -> Option<&Subscription> {
      self.records.iter().find(|s| s.key == key)
   }

   pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
      self.records.iter()
   }

   pub fn len(&self) -> usize {
      self.records.len()
   }

   pub fn is_empty(&self) -> bool {
      self.records.is_empty()
   }

   fn next_context(&mut self) -> SubscriptionContext {
      self.next_context += 1;
      SubscriptionContext(self.next_context)
   }

   /// Enables notifications on a connected characteristic and registers for
   /// its value changes.
   pub fn subscribe(
      &mut self,
      connections: &ConnectionManager,
      adapter: &dyn Adapter,
      events: &EventQueue,
      key: CharacteristicKey,
   ) -> Result<()> {
      let (connected, characteristic) = connections.resolve(key, "to subscribe to.")?;
      if !characteristic.is_notifiable {
         return Err(BridgeError::NotNotifiable(key.characteristic));
      }
      if self.find(key).is_some() {
         events.warn(format!(
            "Characteristic {} of {} is already subscribed",
            key.characteristic, key.device
         ));
         return Ok(());
      }

      let descriptors = fetch("Could not retrieve characteristic descriptors", |buf| {
         adapter.fetch_descriptors(connected.handle(), characteristic, buf)
      })?;
      let config = descriptors
         .iter()
         .find(|d| d.kind == DescriptorKind::ClientConfiguration)
         .ok_or_else(|| {
            BridgeError::not_found(format!(
               "Client Config descriptor for characteristic {}",
               key.characteristic
            ))
         })?;
      adapter
         .set_descriptor_value(connected.handle(), config, DescriptorValue::ENABLE_NOTIFICATION)
         .map_err(|e| {
            BridgeError::os_api(
               format!("Could not set Client Config descriptor for characteristic {}", key.characteristic),
               e,
            )
         })?;

      // Published before registering: the adapter may deliver a value from
      // inside the registration call.
      let context = self.next_context();
      self.live.publish(context, key);
      let token = match adapter.register_value_changed(
         connected.handle(),
         characteristic,
         context,
         self.callback.clone(),
      ) {
         Ok(token) => token,
         Err(e) => {
            self.live.withdraw(context);
            return Err(BridgeError::os_api(
               format!("Could not register for value changes of characteristic {}", key.characteristic),
               e,
            ));
         },
      };

      info!("Subscribed to {} of {} as {context}", key.characteristic, key.device);
      self.records.push(Subscription {
         key,
         characteristic: *characteristic,
         context,
         token,
      });
      events.send(BleEvent::DidUpdateNotificationStateForCharacteristic {
         device: key.device,
         service: None,
         characteristic: key.characteristic,
      });
      Ok(())
   }

   /// Removes a subscription. The record survives a failed unregister.
   pub fn unsubscribe(&mut self, adapter: &dyn Adapter, events: &EventQueue, key: CharacteristicKey) -> Result<()> {
      let idx = self.records.iter().position(|s| s.key == key).ok_or_else(|| {
         BridgeError::not_found(format!(
            "notification registration for characteristic {}",
            key.characteristic
         ))
      })?;

      adapter
         .unregister_callback(&self.records[idx].token)
         .map_err(|e| {
            BridgeError::os_api(
               format!("Could not unregister from characteristic {}", key.characteristic),
               e,
            )
         })?;

      let subscription = self.records.remove(idx);
      self.live.withdraw(subscription.context);
      info!("Unsubscribed from {} of {}", key.characteristic, key.device);
      events.send(BleEvent::DidUpdateNotificationStateForCharacteristic {
         device: key.device,
         service: None,
         characteristic: key.characteristic,
      });
      Ok(())
   }

   /// Unregisters every subscription on one connected service. Failures are
   /// reported and leave that record in place; the sweep continues.
   pub fn unregister_for_service(&mut self, service: ServiceKey, adapter: &dyn Adapter, events: &EventQueue) {
      let mut idx = 0;
      while idx < self.records.len() {
         let subscription = &self.records[idx];
         if subscription.key.service_key() != service {
            idx += 1;
            continue;
         }

         if let Err(e) = adapter.unregister_callback(&subscription.token) {
            events.report(&BridgeError::os_api(
               format!(
                  "Could not unregister from characteristic {}",
                  subscription.key.characteristic
               ),
               e,
            ));
            idx += 1;
            continue;
         }

         let subscription = self.records.remove(idx);
         self.live.withdraw(subscription.context);
         events.send(BleEvent::DidUpdateNotificationStateForCharacteristic {
            device: service.device,
            service: Some(service.service),
            characteristic: subscription.key.characteristic,
         });
      }
   }

   /// Forgets every subscription without unregistering.
   pub fn clear(&mut self) {
      if !self.records.is_empty() {
         warn!(
            "Dropping {} subscriptions that could not be unregistered",
            self.records.len()
         );
      }
      self.records.clear();
      self.live.entries.write().clear();
   }
}
