pub mod cleaner;
pub mod error;
pub mod filter;
pub mod fsbridge;
pub mod logging;
pub mod monitor;
pub mod options;
pub mod pathutil;
pub mod vfile;

#[cfg(test)]
mod test_utils;
