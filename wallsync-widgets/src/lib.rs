pub mod cards;
pub mod fanout;
pub mod host;
pub mod registry;

pub use cards::{CardError, CardTemplates, LOCAL_FILE_PLACEHOLDER_URL, WidgetData};
pub use fanout::{
    CardSink, DEFAULT_POLL_INTERVAL, FanoutError, FanoutReport, NotificationFanout, RenderedCard,
    SinkError, StatusSource, StoreStatus, SyncRequester, WidgetContext, WidgetSurfaceHandler,
};
pub use host::{HostMessage, HostSink, HostState, SurfaceMessage};
pub use registry::WidgetInstanceRegistry;
