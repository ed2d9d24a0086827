use crate::error::TransportError;

/// Messaging channel between the device and the update controller.
///
/// Chunks arrive outside of this trait: the binding's receive path hands
/// them to an [`crate::OtaInbox`] while a transfer is prepared. Rejected
/// chunks get no reply; the orchestrator asks for the same index again after
/// the next arrival or round-trip timeout, so redelivery is up to the
/// controller answering those requests.
#[allow(async_fn_in_trait)]
pub trait OtaTransport {
    /// Start receiving chunks
    async fn prepare(&self) -> Result<(), TransportError>;

    /// Stop receiving chunks
    async fn finish(&self) -> Result<(), TransportError>;

    /// Ask the controller for the next chunk, or for the first one
    async fn request(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Announce the running version
    async fn report(&self, data: &[u8]) -> Result<(), TransportError>;
}
