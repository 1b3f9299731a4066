mod device_view;
mod painter;
mod session_view;
mod spinner;
mod table;

pub(crate) use self::painter::Painter;
pub(crate) use self::session_view::{ConnectedView, DataView, SummaryView};
pub(crate) use self::spinner::Spinner;
