//! Record of the APDUs exchanged during a transaction

use bytes::Bytes;

/// One request and the card response to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduExchange {
    /// Raw request
    pub request: Bytes,
    /// Raw response, absent when the card never answered
    pub response: Option<Bytes>,
}

/// Every APDU exchanged since the transaction manager was created
///
/// Attached to each [`crate::TransactionError`] so the failure can be
/// analysed offline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditTrail {
    exchanges: Vec<ApduExchange>,
}

impl AuditTrail {
    /// Record a batch, responses matched positionally with requests
    pub(crate) fn record(&mut self, requests: impl IntoIterator<Item = Bytes>, responses: &[Bytes]) {
        self.exchanges.extend(requests.into_iter().enumerate().map(|(i, request)| ApduExchange {
            request,
            response: responses.get(i).cloned(),
        }));
    }

    /// Recorded exchanges, oldest first
    pub fn exchanges(&self) -> &[ApduExchange] {
        &self.exchanges
    }

    /// Number of recorded exchanges
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether nothing was exchanged yet
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
