// MIT License - Copyright (c) 2021 TJForc
// Change-of-state reconciliation, status fetches, names and discovery

use tracing::{debug, info, warn};

use crate::constants::{msg, prop, ObjectClass, MAX_NUMBER_AREAS};
use crate::devices::{AreaStatusFlags, ZoneStatusFlags};
use crate::error::{AtsError, Result};
use crate::message::Message;
use crate::panel::AtsPanel;
use crate::protocol::{self, NamesChunk, Request};
use crate::state::Gates;

/// A named zone or area found by [`AtsPanel::discover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredObject {
    pub class: ObjectClass,
    pub number: u32,
    pub name: String,
}

impl AtsPanel {
    /// Ask the panel which objects of `class` changed and have each
    /// registered listener mirroring one of them refresh itself.
    ///
    /// Returns the number of changed indices reported. "Nothing changed" is
    /// a success with zero.
    pub async fn update_changed(&self, class: ObjectClass) -> Result<usize> {
        self.require_logged_in()?;
        let response = self.call(Request::ChangedObjects { class }).await?;
        let changed = protocol::changed_indices(&response, class)?;
        if changed.is_empty() {
            return Ok(0);
        }
        debug!("Changed {}s: {:?}", class, changed);

        for &index in changed.iter().filter(|&&i| i <= class.capacity()) {
            for listener in self.inner.listeners.tracking(class, index) {
                listener.on_changed_status(self).await;
            }
        }
        Ok(changed.len())
    }

    pub async fn update_changed_zones(&self) -> Result<usize> {
        self.update_changed(ObjectClass::Zone).await
    }

    pub async fn update_changed_areas(&self) -> Result<usize> {
        self.update_changed(ObjectClass::Area).await
    }

    /// Current flags of zone `number`.
    pub async fn zone_status(&self, number: u32) -> Result<ZoneStatusFlags> {
        let response = self.object_status(ObjectClass::Zone, number).await?;
        Ok(ZoneStatusFlags::from_names(protocol::true_flags(&response)?))
    }

    /// Current flags of area `number`.
    pub async fn area_status(&self, number: u32) -> Result<AreaStatusFlags> {
        let response = self.object_status(ObjectClass::Area, number).await?;
        Ok(AreaStatusFlags::from_names(protocol::true_flags(&response)?))
    }

    async fn object_status(&self, class: ObjectClass, index: u32) -> Result<Message> {
        if index == 0 || index > class.capacity() {
            return Err(AtsError::InvalidDeviceId {
                id: index,
                max: class.capacity(),
            });
        }
        self.require_logged_in()?;
        let response = self.call(Request::Status { class, index }).await?;
        if !response.is(class.status_response()) {
            return Err(AtsError::UnexpectedResponse {
                request: class.status_request().to_string(),
                response: response.name,
            });
        }
        Ok(response)
    }

    /// Names page starting at `index`.
    pub async fn names_chunk(&self, class: ObjectClass, index: u32) -> Result<NamesChunk> {
        self.require_logged_in()?;
        let response = self.call(Request::Names { class, index }).await?;
        NamesChunk::parse(&response, class)
    }

    /// Page through the zone and area names and return every named object.
    pub async fn discover(&self) -> Result<Vec<DiscoveredObject>> {
        let mut found = Vec::new();
        for class in [ObjectClass::Zone, ObjectClass::Area] {
            let mut index = 1;
            while index <= class.capacity() {
                let chunk = self.names_chunk(class, index).await?;
                found.extend(
                    chunk
                        .named()
                        .filter(|(number, _)| (1..=class.capacity()).contains(number))
                        .map(|(number, name)| DiscoveredObject {
                            class,
                            number,
                            name: name.to_string(),
                        }),
                );
                if chunk.advance == 0 {
                    break;
                }
                index = chunk.start.max(index) + chunk.advance;
            }
        }
        info!("Discovered {} named objects", found.len());
        Ok(found)
    }

    /// Ask the gateway whether the panel still answers.
    pub async fn is_alive(&self) -> Result<bool> {
        self.require_logged_in()?;
        let response = self.call(Request::IsAlive).await?;
        if response.is(msg::RETURN_VOID) {
            return Ok(true);
        }
        self.handle_error(&response.error_text()).await;
        Ok(false)
    }

    /// Check the user's privileges for `area_id` (0 is the panel itself).
    pub async fn privileges(&self, area_id: u32) -> Result<bool> {
        self.require_logged_in()?;
        debug!("Verifying user privileges for area {}", area_id);
        match self.call(Request::Privileges { area_id }).await {
            Ok(_) => Ok(true),
            Err(AtsError::Panel(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Privileges for the panel and each area, indexed by area id.
    pub async fn user_privileges(&self) -> Result<Vec<bool>> {
        let mut granted = Vec::with_capacity(MAX_NUMBER_AREAS as usize + 1);
        for area_id in 0..=MAX_NUMBER_AREAS {
            granted.push(self.privileges(area_id).await?);
        }
        Ok(granted)
    }

    pub(crate) fn require_logged_in(&self) -> Result<()> {
        if self.inner.state.has(Gates::LOGGED_IN) {
            Ok(())
        } else {
            Err(AtsError::Offline)
        }
    }
}

/// The changed-object flags carried by a `msgCOS.ALL` push.
pub(crate) fn flagged_classes(push: &Message) -> Vec<ObjectClass> {
    let mut classes = Vec::new();
    for (id, class) in [
        (prop::APPOBJ_ZONE, ObjectClass::Zone),
        (prop::APPOBJ_AREA, ObjectClass::Area),
    ] {
        match push.value(id).map(|v| v.as_bool(id)) {
            Some(Ok(true)) => classes.push(class),
            Some(Err(e)) => warn!("Ignoring malformed change notification: {}", e),
            _ => {}
        }
    }
    classes
}
