//! A test family whose handlers count their callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use gnlink_core::attr::AttrType;
use gnlink_core::family::SessionData;
use gnlink_core::{
    Attribute, AttributeKind, Attributes, Command, Family, HandlerResult, IntWidth, Message,
    StreamHandler, StreamPlan, errno,
};

pub const ATTR_TEXT: AttrType = 1;
pub const ATTR_INDEX: AttrType = 2;

/// One-shot: echoes `ATTR_TEXT`.
pub const CMD_ECHO: u8 = 1;
/// One-shot: succeeds with status 0.
pub const CMD_SILENT: u8 = 2;
/// Streaming: `total` parts carrying `ATTR_INDEX`.
pub const CMD_DUMP: u8 = 3;
/// One-shot: always `-EINVAL`.
pub const CMD_FAIL: u8 = 4;

/// Callback counts shared between a family and the test observing it.
#[derive(Debug, Default)]
pub struct Counters {
    one_shot: AtomicU32,
    started: AtomicU32,
    produced: AtomicU32,
    done: AtomicU32,
}

impl Counters {
    pub fn one_shot(&self) -> u32 {
        self.one_shot.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn produced(&self) -> u32 {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> u32 {
        self.done.load(Ordering::SeqCst)
    }
}

struct CountingStream {
    total: u32,
    counters: Arc<Counters>,
}

impl StreamHandler for CountingStream {
    fn start(&self, _request: &Message) -> Result<StreamPlan, i32> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        Ok(StreamPlan::new(self.total))
    }

    fn produce(&self, _data: &mut SessionData, index: u32) -> Attributes {
        self.counters.produced.fetch_add(1, Ordering::SeqCst);
        Attributes::new().with(Attribute::u32(ATTR_INDEX, index))
    }

    fn done(&self, _data: &mut SessionData) {
        self.counters.done.fetch_add(1, Ordering::SeqCst);
    }
}

/// Build a family named `name` whose dump yields `total` parts.
pub fn counting_family(name: &str, total: u32) -> (Family, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let echo_counters = Arc::clone(&counters);
    let family = Family::builder(name, 1)
        .attribute(ATTR_TEXT, AttributeKind::String)
        .attribute(ATTR_INDEX, AttributeKind::Integer(IntWidth::U32))
        .command(Command::one_shot(CMD_ECHO, move |request: &Message| {
            echo_counters.one_shot.fetch_add(1, Ordering::SeqCst);
            let text = request
                .attributes
                .get(ATTR_TEXT)
                .cloned()
                .into_iter()
                .collect();
            HandlerResult::reply(text)
        }))
        .command(Command::one_shot(CMD_SILENT, |_: &Message| HandlerResult::ok()))
        .command(Command::one_shot(CMD_FAIL, |_: &Message| {
            HandlerResult::failed(errno::EINVAL)
        }))
        .command(Command::streaming(
            CMD_DUMP,
            CountingStream {
                total,
                counters: Arc::clone(&counters),
            },
        ))
        .build()
        .expect("counting family is well-formed");
    (family, counters)
}
