//! Signals scanned out of raw worker output.
//!
//! - the completion sentinel, matched as an exact token on its own line,
//!   either bare or wrapped as `<promise>SENTINEL</promise>`
//! - `<next>...</next>` blocks listing the worker's planned next steps

mod parser;

pub use parser::{WorkerSignals, extract_next_steps, sentinel_present};
