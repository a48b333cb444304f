//! The `echo_demo` family used by the CLI and the integration tests.

use gnlink_config::DemoConfig;
use tracing::info;

use crate::attr::{AttrType, Attribute, AttributeKind, Attributes};
use crate::family::{
    Command, Family, FamilyError, HandlerResult, SessionData, StreamHandler, StreamPlan,
};
use crate::message::{errno, Message};

pub const FAMILY_NAME: &str = "echo_demo";
pub const VERSION: u8 = 1;

pub const ATTR_MSG: AttrType = 1;

pub const CMD_ECHO: u8 = 1;
/// Always answers with `-EINVAL`.
pub const CMD_ECHO_FAIL: u8 = 2;
/// Dump of `dump_runs` parts, each replying as `ECHO`.
pub const CMD_ECHO_DUMP: u8 = 3;

pub fn family(config: &DemoConfig) -> Result<Family, FamilyError> {
    Family::builder(FAMILY_NAME, VERSION)
        .attribute(ATTR_MSG, AttributeKind::String)
        .command(Command::one_shot(CMD_ECHO, echo))
        .command(
            Command::one_shot(CMD_ECHO_FAIL, |request: &Message| {
                info!(flags = request.flags.bits(), "echo_fail invoked");
                HandlerResult::failed(errno::EINVAL)
            })
            .relaxed(),
        )
        .command(Command::streaming(
            CMD_ECHO_DUMP,
            EchoDump {
                runs: config.dump_runs,
                message: config.dump_message.clone(),
            },
        ))
        .build()
}

fn echo(request: &Message) -> HandlerResult {
    let Ok(text) = request.attributes.get_str(ATTR_MSG) else {
        return HandlerResult::failed(errno::EINVAL);
    };
    info!(origin = request.origin, text, "echo");
    match Attribute::string(ATTR_MSG, text) {
        Ok(attr) => HandlerResult::reply(Attributes::new().with(attr)),
        Err(_) => HandlerResult::failed(errno::EINVAL),
    }
}

struct EchoDump {
    runs: u32,
    message: String,
}

impl StreamHandler for EchoDump {
    fn start(&self, request: &Message) -> Result<StreamPlan, i32> {
        info!(origin = request.origin, runs = self.runs, "dump started");
        let part = Attribute::string(ATTR_MSG, &self.message).map_err(|_| -errno::EINVAL)?;
        Ok(StreamPlan::new(self.runs)
            .with_data(part)
            .with_reply_command(CMD_ECHO))
    }

    fn produce(&self, data: &mut SessionData, index: u32) -> Attributes {
        info!(index, remaining = self.runs.saturating_sub(index + 1), "dump part");
        data.downcast_ref::<Attribute>()
            .map(|part| Attributes::new().with(part.clone()))
            .unwrap_or_default()
    }

    fn done(&self, _data: &mut SessionData) {
        info!("dump done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Handler;
    use crate::message::Flags;

    fn config() -> DemoConfig {
        DemoConfig {
            dump_runs: 2,
            dump_message: "part".into(),
        }
    }

    fn one_shot(family: &Family, id: u8, request: &Message) -> HandlerResult {
        match family.command(id).unwrap().handler() {
            Handler::OneShot(handler) => handler.handle(request),
            Handler::Streaming(_) => panic!("command {id} is streaming"),
        }
    }

    #[test]
    fn test_echo_returns_message() {
        let family = family(&config()).unwrap();
        let request = Message::request(0x11, CMD_ECHO, VERSION)
            .with_attribute(Attribute::string(ATTR_MSG, "hello").unwrap());
        let result = one_shot(&family, CMD_ECHO, &request);
        assert_eq!(result.status, 1);
        assert_eq!(result.attributes.get_str(ATTR_MSG).unwrap(), "hello");
    }

    #[test]
    fn test_echo_without_message_fails() {
        let family = family(&config()).unwrap();
        let request = Message::request(0x11, CMD_ECHO, VERSION);
        assert_eq!(one_shot(&family, CMD_ECHO, &request).status, -errno::EINVAL);
    }

    #[test]
    fn test_echo_fail_is_relaxed_and_fails() {
        let family = family(&config()).unwrap();
        let command = family.command(CMD_ECHO_FAIL).unwrap();
        assert_eq!(command.validation(), crate::policy::Validation::Relaxed);
        let request = Message::request(0x11, CMD_ECHO_FAIL, VERSION).with_flags(Flags::ACK);
        assert_eq!(one_shot(&family, CMD_ECHO_FAIL, &request).status, -errno::EINVAL);
    }

    #[test]
    fn test_dump_parts_carry_configured_message() {
        let family = family(&config()).unwrap();
        let Handler::Streaming(handler) = family.command(CMD_ECHO_DUMP).unwrap().handler() else {
            panic!("dump must be streaming");
        };
        let mut plan = handler
            .start(&Message::request(0x11, CMD_ECHO_DUMP, VERSION))
            .unwrap();
        assert_eq!(plan.total, 2);
        assert_eq!(plan.reply_command, Some(CMD_ECHO));
        let attrs = handler.produce(&mut plan.data, 0);
        assert_eq!(attrs.get_str(ATTR_MSG).unwrap(), "part");
    }
}
