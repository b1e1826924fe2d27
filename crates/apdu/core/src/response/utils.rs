//! Utility functions for APDU response handling

use tracing::debug;

use crate::Error;
use crate::response::status::StatusWord;

/// Extract status word and payload from raw APDU response data
///
/// # Errors
/// Returns an error if the data is too short to contain a valid status word.
pub fn extract_status_and_payload(data: &[u8]) -> Result<(StatusWord, &[u8]), Error> {
    if data.len() < 2 {
        debug!("Response too short: {} bytes", data.len());
        return Err(Error::IncompleteResponse);
    }

    let len = data.len();
    Ok((StatusWord::new(data[len - 2], data[len - 1]), &data[..len - 2]))
}

/// Status word of raw response data, if long enough to carry one
pub fn status_of(data: &[u8]) -> Option<StatusWord> {
    extract_status_and_payload(data).ok().map(|(sw, _)| sw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_status_and_payload() {
        // Test with payload and status
        let data = [0x01, 0x02, 0x03, 0x90, 0x00];
        let result = extract_status_and_payload(&data).unwrap();
        assert_eq!(result.0, StatusWord::new(0x90, 0x00));
        assert_eq!(result.1, &[0x01, 0x02, 0x03]);

        // Test with only status
        let data = [0x90, 0x00];
        let result = extract_status_and_payload(&data).unwrap();
        assert_eq!(result.0, StatusWord::new(0x90, 0x00));
        assert!(result.1.is_empty());

        // Test with insufficient data
        assert!(extract_status_and_payload(&[0x90]).is_err());
        assert_eq!(status_of(&[0x90]), None);
    }
}
