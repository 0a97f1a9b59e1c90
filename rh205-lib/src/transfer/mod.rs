//! Chunked bulk transfers: waveform download with NAK bitmaps, firmware upload with
//! selective retransmission.

pub mod download;
pub mod upload;

pub use download::{TransferPlan, Waveform};
pub use upload::{FirmwareImage, UpgradeProgress, UpgradeReport, UploadPlan};
