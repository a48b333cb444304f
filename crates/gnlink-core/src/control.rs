//! The control family (`nlctrl`).
//!
//! Always registered at [`CONTROL_FAMILY_ID`]. It exposes the registry over
//! the protocol itself: `GET_FAMILY` resolves one family by name or id and
//! `LIST_FAMILIES` dumps every registered family.

use tracing::debug;

use crate::attr::{AttrType, Attribute, AttributeError, AttributeKind, Attributes, IntWidth};
use crate::codec::MIN_FAMILY_ID;
use crate::family::{Command, Family, HandlerResult, SessionData, StreamHandler, StreamPlan};
use crate::message::{errno, FamilyId, Message};
use crate::policy::AttributeSchema;
use crate::registry::{Registry, RegistryRef};

pub const CONTROL_FAMILY_ID: FamilyId = MIN_FAMILY_ID;
pub const CONTROL_FAMILY_NAME: &str = "nlctrl";
pub const CONTROL_VERSION: u8 = 2;

/// Reply command carrying one family description.
pub const CMD_NEW_FAMILY: u8 = 1;
pub const CMD_GET_FAMILY: u8 = 3;
pub const CMD_LIST_FAMILIES: u8 = 4;

pub const ATTR_FAMILY_ID: AttrType = 1;
pub const ATTR_FAMILY_NAME: AttrType = 2;
pub const ATTR_VERSION: AttrType = 3;
pub const ATTR_MAX_ATTR: AttrType = 5;

/// Description of one registered family, as carried by `NEW_FAMILY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyInfo {
    pub id: FamilyId,
    pub name: String,
    pub version: u32,
    pub max_attr: u32,
}

impl FamilyInfo {
    pub fn of(id: FamilyId, family: &Family) -> Self {
        Self {
            id,
            name: family.name().to_string(),
            version: u32::from(family.version()),
            max_attr: u32::from(family.schema().max_type()),
        }
    }

    pub fn to_attributes(&self) -> Attributes {
        // Family names are checked for NUL bytes when the family is built.
        let mut name = Vec::with_capacity(self.name.len() + 1);
        name.extend_from_slice(self.name.as_bytes());
        name.push(0);
        Attributes::new()
            .with(Attribute::u16(ATTR_FAMILY_ID, self.id))
            .with(Attribute::new(ATTR_FAMILY_NAME, name))
            .with(Attribute::u32(ATTR_VERSION, self.version))
            .with(Attribute::u32(ATTR_MAX_ATTR, self.max_attr))
    }

    pub fn from_attributes(attributes: &Attributes) -> Result<Self, AttributeError> {
        Ok(Self {
            id: attributes.get_u16(ATTR_FAMILY_ID)?,
            name: attributes.get_str(ATTR_FAMILY_NAME)?.to_string(),
            version: attributes.get_u32(ATTR_VERSION)?,
            max_attr: attributes.get_u32(ATTR_MAX_ATTR)?,
        })
    }
}

fn schema() -> AttributeSchema {
    AttributeSchema::new()
        .with(ATTR_FAMILY_ID, AttributeKind::Integer(IntWidth::U16))
        .with(ATTR_FAMILY_NAME, AttributeKind::String)
        .with(ATTR_VERSION, AttributeKind::Integer(IntWidth::U32))
        .with(ATTR_MAX_ATTR, AttributeKind::Integer(IntWidth::U32))
}

pub(crate) fn family(registry: RegistryRef) -> Family {
    let lookup = registry.clone();
    Family::from_parts(
        CONTROL_FAMILY_NAME,
        CONTROL_VERSION,
        schema(),
        [
            Command::one_shot(CMD_GET_FAMILY, move |request: &Message| {
                get_family(&lookup, request)
            }),
            Command::streaming(CMD_LIST_FAMILIES, ListFamilies { registry }),
        ],
    )
}

fn get_family(registry: &RegistryRef, request: &Message) -> HandlerResult {
    let Some(registry) = registry.upgrade() else {
        return HandlerResult::failed(errno::ENOENT);
    };
    let id = if let Ok(name) = request.attributes.get_str(ATTR_FAMILY_NAME) {
        match registry.resolve(name) {
            Ok(id) => id,
            Err(_) => return HandlerResult::failed(errno::ENOENT),
        }
    } else if let Ok(id) = request.attributes.get_u16(ATTR_FAMILY_ID) {
        id
    } else {
        return HandlerResult::failed(errno::EINVAL);
    };
    match registry.get(id) {
        Some(family) => {
            debug!(family = family.name(), id, "family lookup");
            HandlerResult::reply(FamilyInfo::of(id, &family).to_attributes())
                .with_command(CMD_NEW_FAMILY)
        }
        None => HandlerResult::failed(errno::ENOENT),
    }
}

struct ListFamilies {
    registry: RegistryRef,
}

impl StreamHandler for ListFamilies {
    fn start(&self, _request: &Message) -> Result<StreamPlan, i32> {
        let registry = self.registry.upgrade().ok_or(-errno::ENOENT)?;
        let snapshot = snapshot(&registry);
        let total = u32::try_from(snapshot.len()).map_err(|_| -errno::ENOMEM)?;
        Ok(StreamPlan::new(total)
            .with_data(snapshot)
            .with_reply_command(CMD_NEW_FAMILY))
    }

    fn produce(&self, data: &mut SessionData, index: u32) -> Attributes {
        data.downcast_ref::<Vec<FamilyInfo>>()
            .and_then(|infos| infos.get(index as usize))
            .map(FamilyInfo::to_attributes)
            .unwrap_or_default()
    }
}

fn snapshot(registry: &Registry) -> Vec<FamilyInfo> {
    registry
        .families()
        .iter()
        .map(|(id, family)| FamilyInfo::of(*id, family))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Handler;
    use pretty_assertions::assert_eq;

    fn get_family_handler(registry: &Registry) -> std::sync::Arc<dyn crate::family::OneShotHandler> {
        let control = registry.get(CONTROL_FAMILY_ID).unwrap();
        match control.command(CMD_GET_FAMILY).unwrap().handler() {
            Handler::OneShot(handler) => handler.clone(),
            Handler::Streaming(_) => panic!("GET_FAMILY must be one-shot"),
        }
    }

    #[test]
    fn test_get_family_by_name() {
        let registry = Registry::new();
        let handler = get_family_handler(&registry);
        let request = Message::request(CONTROL_FAMILY_ID, CMD_GET_FAMILY, CONTROL_VERSION)
            .with_attribute(Attribute::string(ATTR_FAMILY_NAME, CONTROL_FAMILY_NAME).unwrap());
        let result = handler.handle(&request);
        assert_eq!(result.status, 1);
        assert_eq!(result.command, Some(CMD_NEW_FAMILY));
        let info = FamilyInfo::from_attributes(&result.attributes).unwrap();
        assert_eq!(
            info,
            FamilyInfo {
                id: CONTROL_FAMILY_ID,
                name: CONTROL_FAMILY_NAME.into(),
                version: u32::from(CONTROL_VERSION),
                max_attr: u32::from(ATTR_MAX_ATTR),
            }
        );
    }

    #[test]
    fn test_get_family_by_id() {
        let registry = Registry::new();
        let handler = get_family_handler(&registry);
        let request = Message::request(CONTROL_FAMILY_ID, CMD_GET_FAMILY, CONTROL_VERSION)
            .with_attribute(Attribute::u16(ATTR_FAMILY_ID, CONTROL_FAMILY_ID));
        let info = FamilyInfo::from_attributes(&handler.handle(&request).attributes).unwrap();
        assert_eq!(info.name, CONTROL_FAMILY_NAME);
    }

    #[test]
    fn test_get_family_errors() {
        let registry = Registry::new();
        let handler = get_family_handler(&registry);
        let unknown = Message::request(CONTROL_FAMILY_ID, CMD_GET_FAMILY, CONTROL_VERSION)
            .with_attribute(Attribute::string(ATTR_FAMILY_NAME, "nope").unwrap());
        assert_eq!(handler.handle(&unknown).status, -errno::ENOENT);

        let empty = Message::request(CONTROL_FAMILY_ID, CMD_GET_FAMILY, CONTROL_VERSION);
        assert_eq!(handler.handle(&empty).status, -errno::EINVAL);
    }

    #[test]
    fn test_list_families_snapshot() {
        let registry = Registry::new();
        let handler = ListFamilies {
            registry: registry.downgrade(),
        };
        let request = Message::request(CONTROL_FAMILY_ID, CMD_LIST_FAMILIES, CONTROL_VERSION);
        let mut plan = handler.start(&request).unwrap();
        assert_eq!(plan.total, 1);
        assert_eq!(plan.reply_command, Some(CMD_NEW_FAMILY));
        let attrs = handler.produce(&mut plan.data, 0);
        assert_eq!(attrs.get_str(ATTR_FAMILY_NAME).unwrap(), CONTROL_FAMILY_NAME);
        assert!(handler.produce(&mut plan.data, 5).is_empty());
    }
}
