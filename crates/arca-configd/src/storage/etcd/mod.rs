//! Replicated key/value backend (etcd) with lease-bound locks and
//! multi-key compare-and-swap transactions.

mod store;

pub use store::EtcdStore;

use std::time::Duration;

use etcd_client::{Client, ConnectOptions, TlsOptions};

use crate::error::{Error, Result};

/// Parameters needed to connect to the replicated backend (§6 backend
/// selection).
#[derive(Debug, Clone)]
pub struct EtcdConnectOptions {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
}

impl EtcdConnectOptions {
    /// Ensure the prefix has exactly one trailing slash, per §6.
    #[must_use]
    pub fn normalized_prefix(&self) -> String {
        if self.prefix.ends_with('/') {
            self.prefix.clone()
        } else {
            format!("{}/", self.prefix)
        }
    }
}

impl From<&crate::config::EtcdOptions> for EtcdConnectOptions {
    fn from(opts: &crate::config::EtcdOptions) -> Self {
        Self {
            endpoints: opts.endpoints.clone(),
            prefix: opts.prefix.clone(),
            timeout: Duration::from_secs(opts.timeout_secs),
            username: opts.username.clone(),
            password: opts.password.clone(),
            cert_file: opts.tls.cert_file.clone(),
            key_file: opts.tls.key_file.clone(),
            ca_file: opts.tls.ca_file.clone(),
        }
    }
}

/// Connect to the replicated backend, enforcing TLS 1.2 minimum when
/// certificates are configured.
pub async fn connect(opts: &EtcdConnectOptions) -> Result<Client> {
    if opts.endpoints.is_empty() {
        return Err(Error::Validation(
            "etcd backend requires at least one endpoint".to_string(),
        ));
    }

    let mut connect_options = ConnectOptions::new().with_timeout(opts.timeout);

    if let (Some(user), Some(pass)) = (&opts.username, &opts.password) {
        connect_options = connect_options.with_user(user.clone(), pass.clone());
    }

    if opts.cert_file.is_some() || opts.key_file.is_some() || opts.ca_file.is_some() {
        let mut tls = TlsOptions::new();
        if let Some(ca) = &opts.ca_file {
            let ca_pem = tokio::fs::read(ca)
                .await
                .map_err(|e| Error::internal("failed to read CA file", e))?;
            tls = tls.ca_certificate(etcd_client::Certificate::from_pem(ca_pem));
        }
        if let (Some(cert), Some(key)) = (&opts.cert_file, &opts.key_file) {
            let cert_pem = tokio::fs::read(cert)
                .await
                .map_err(|e| Error::internal("failed to read client certificate", e))?;
            let key_pem = tokio::fs::read(key)
                .await
                .map_err(|e| Error::internal("failed to read client key", e))?;
            tls = tls.identity(etcd_client::Identity::from_pem(cert_pem, key_pem));
        }
        connect_options = connect_options.with_tls(tls);
    }

    Client::connect(&opts.endpoints, Some(connect_options))
        .await
        .map_err(|e| Error::internal("failed to connect to etcd", e))
}

/// Connect and wrap the client in an [`EtcdStore`], the factory used by
/// [`crate::open_store`] when `Config.Backend == "etcd"`.
pub async fn open(opts: &EtcdConnectOptions) -> Result<EtcdStore> {
    let client = connect(opts).await?;
    Ok(EtcdStore::new(client, opts.normalized_prefix(), opts.timeout))
}
