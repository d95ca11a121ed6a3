//! Topic aliases for the `log` macros used across the class engines.

#![allow(unused_imports)]

pub(crate) use log::debug as trace_bot_headers;
pub(crate) use log::debug as trace_bot_stages;
pub(crate) use log::trace as trace_bot_bytes;
pub(crate) use log::debug as trace_scsi;
pub(crate) use log::debug as trace_dfu_state;
pub(crate) use log::debug as trace_usb_control;
pub(crate) use log::warn as warn_class;
