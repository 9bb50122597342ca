pub mod observability;
pub mod toml;

use rustls::crypto::ring;

use crate::observability::init_tracing;

/// Initializes process-wide ambient state: panic hook, tracing, and the
/// rustls crypto provider. The embedding binary (out of scope for this
/// crate) is expected to call this once, before constructing anything that
/// dials out over TLS.
///
/// # Errors
///
/// Returns an error if the rustls crypto provider fails to install.
pub fn setup_application(name: &'static str) -> anyhow::Result<()> {
    setup_panic_hook();
    init_tracing(name);
    setup_tls_provider()
}

/// Installs a panic hook that logs the panic via `tracing` before the
/// default hook unwinds, so panics show up in the same log stream as
/// everything else instead of going straight to stderr.
pub fn setup_panic_hook() {
    std::panic::set_hook(Box::new(move |panic_info| {
        if let Some(location) = panic_info.location() {
            tracing::error!(
                message = %panic_info,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic_info);
        }

        #[allow(clippy::exit)]
        std::process::exit(1);
    }))
}

/// Installs the rustls crypto provider (ring backend).
///
/// rustls 0.23+ no longer picks a default provider automatically; dialing
/// out over TLS without calling this panics on the first handshake.
pub fn setup_tls_provider() -> anyhow::Result<()> {
    ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("failed to install rustls crypto provider: {e:?}"))
}
