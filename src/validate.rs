use std::path::Path;

use crate::error::{Error, Result};
use crate::models::Container;

/// Infers the (source, target) container pair from a file name.
pub fn classify(file_name: &str) -> Result<(Container, Container)> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    let source = match extension.as_deref() {
        Some("mp4") => Container::Mp4,
        Some("webm") => Container::Webm,
        _ => return Err(Error::UnsupportedFormat(file_name.to_owned())),
    };

    Ok((source, source.other()))
}

pub fn check_size(size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(Error::FileTooLarge { size, limit });
    }

    Ok(())
}

/// Download name for the converted file: the original base name with the
/// target extension.
pub fn output_file_name(file_name: &str, target: Container) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty() && !stem.starts_with('.'))
        .unwrap_or("converted");

    format!("{stem}.{target}")
}
