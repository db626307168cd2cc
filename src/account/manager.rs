use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::auth::{Authenticator, OAuth2Authenticator, PasswordAuthenticator};
use crate::cache::ChangeProcessor;
use crate::config::{AccountConfig, AuthMethod, ProviderConfig};
use crate::credentials::CredentialStore;
use crate::model::{Account, AccountId};
use crate::provider::gmail::GmailClient;
use crate::provider::graph::GraphClient;
use crate::provider::imap::ImapClient;
use crate::sync::{Backend, Synchronizer, SynchronizerHandle, spawn_synchronizer};

/// Builds the remote backend for an account.
pub trait BackendBuilder: Send + Sync {
    fn build(&self, config: &AccountConfig, account: &Account) -> Result<Backend>;
}

/// Real provider clients, authenticated from the credential store.
pub struct ProviderBackends;

impl ProviderBackends {
    fn authenticator(config: &AccountConfig, account: &Account) -> Result<Arc<dyn Authenticator>> {
        if config.auth == AuthMethod::Password && !matches!(config.provider, ProviderConfig::Imap { .. }) {
            anyhow::bail!(
                "Account '{}' uses {} which requires oauth2 authentication",
                config.id,
                config.provider_kind().as_str()
            );
        }

        let credentials = CredentialStore::new(&config.email);
        if !credentials.has_credentials() {
            anyhow::bail!(
                "No credentials stored for {}. Store a password or refresh token, or set MAILSYNC_PASSWORD.",
                config.email
            );
        }

        match &config.auth {
            AuthMethod::Password => Ok(Arc::new(PasswordAuthenticator::new(credentials))),
            AuthMethod::OAuth2 {
                client_id,
                client_secret,
            } => Ok(Arc::new(OAuth2Authenticator::new(
                account,
                client_id.clone(),
                client_secret.clone(),
                credentials,
            )?)),
        }
    }
}

impl BackendBuilder for ProviderBackends {
    fn build(&self, config: &AccountConfig, account: &Account) -> Result<Backend> {
        let authenticator = Self::authenticator(config, account)?;

        let backend = match &config.provider {
            ProviderConfig::Outlook => Backend::Delta(Arc::new(GraphClient::new(account.clone(), authenticator)?)),
            ProviderConfig::Gmail => Backend::History(Arc::new(GmailClient::new(account.clone(), authenticator)?)),
            ProviderConfig::Imap { imap, smtp } => Backend::Protocol(Arc::new(ImapClient::new(
                account.clone(),
                imap.clone(),
                smtp.clone(),
                authenticator,
            ))),
        };
        Ok(backend)
    }
}

/// Account id -> synchronizer registry. At most one synchronizer runs per account.
pub struct SynchronizerFactory {
    cache: Arc<dyn ChangeProcessor>,
    backends: Box<dyn BackendBuilder>,
    registry: Mutex<HashMap<AccountId, SynchronizerHandle>>,
}

impl SynchronizerFactory {
    pub fn new(cache: Arc<dyn ChangeProcessor>, backends: impl BackendBuilder + 'static) -> Self {
        Self {
            cache,
            backends: Box::new(backends),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Return the running synchronizer for the account, spawning it first if needed.
    ///
    /// The registry lock is held across creation, so concurrent callers for the
    /// same account always get the same instance.
    pub async fn get_or_create(&self, config: &AccountConfig) -> Result<SynchronizerHandle> {
        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry.get(&config.id)
            && handle.is_running()
        {
            return Ok(handle.clone());
        }

        let account = config.to_account();
        self.cache
            .ensure_account(&account)
            .await
            .with_context(|| format!("Failed to register account '{}'", config.id))?;
        // Keep the profile fetched by earlier runs
        let account = self.cache.get_account(&account.id).await?.unwrap_or(account);

        let backend = self
            .backends
            .build(config, &account)
            .with_context(|| format!("Failed to set up provider for '{}'", config.id))?;
        let handle = spawn_synchronizer(Synchronizer::new(account, backend, Arc::clone(&self.cache)));

        tracing::info!(
            "Created synchronizer for '{}' ({})",
            config.id,
            config.provider_kind().as_str()
        );
        registry.insert(config.id.clone(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, account_id: &str) -> Option<SynchronizerHandle> {
        self.registry.lock().await.get(account_id).cloned()
    }

    pub async fn handles(&self) -> Vec<SynchronizerHandle> {
        self.registry.lock().await.values().cloned().collect()
    }

    /// Stop the account's synchronizer and delete everything cached for it.
    /// Returns whether a synchronizer was running.
    pub async fn remove(&self, account_id: &str) -> Result<bool> {
        let handle = self.registry.lock().await.remove(account_id);
        if let Some(handle) = &handle {
            handle.shutdown().await;
        }
        self.cache
            .delete_account(account_id)
            .await
            .with_context(|| format!("Failed to delete account '{}'", account_id))?;
        tracing::info!("Removed account '{}'", account_id);
        Ok(handle.is_some())
    }

    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = self.registry.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.shutdown().await;
        }
        tracing::info!("Stopped {} synchronizers", handles.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::provider::fake::FakeProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackends {
        provider: Arc<FakeProvider>,
        built: Arc<AtomicUsize>,
    }

    impl BackendBuilder for FakeBackends {
        fn build(&self, _config: &AccountConfig, _account: &Account) -> Result<Backend> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Backend::Delta(self.provider.clone()))
        }
    }

    fn outlook(id: &str) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            email: format!("{}@contoso.com", id),
            display_name: None,
            provider: ProviderConfig::Outlook,
            auth: AuthMethod::OAuth2 {
                client_id: "client".to_string(),
                client_secret: None,
            },
        }
    }

    async fn factory() -> (SynchronizerFactory, Arc<Cache>, Arc<AtomicUsize>) {
        let cache = Arc::new(Cache::open_in_memory().await.unwrap());
        let built = Arc::new(AtomicUsize::new(0));
        let backends = FakeBackends {
            provider: Arc::new(FakeProvider::new()),
            built: built.clone(),
        };
        (SynchronizerFactory::new(cache.clone(), backends), cache, built)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let (factory, cache, built) = factory().await;
        let config = outlook("a");

        let first = factory.get_or_create(&config).await.unwrap();
        let second = factory.get_or_create(&config).await.unwrap();

        assert!(first.same_instance(&second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(cache.get_account("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_creation_spawns_once() {
        let (factory, _cache, built) = factory().await;
        let config = outlook("a");

        let (first, second) = tokio::join!(factory.get_or_create(&config), factory.get_or_create(&config));

        assert!(first.unwrap().same_instance(&second.unwrap()));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accounts_get_separate_synchronizers() {
        let (factory, _cache, _built) = factory().await;

        let a = factory.get_or_create(&outlook("a")).await.unwrap();
        let b = factory.get_or_create(&outlook("b")).await.unwrap();

        assert!(!a.same_instance(&b));
        assert_eq!(factory.handles().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_stops_and_deletes() {
        let (factory, cache, built) = factory().await;
        let config = outlook("a");
        let old = factory.get_or_create(&config).await.unwrap();

        assert!(factory.remove("a").await.unwrap());
        assert!(!old.is_running());
        assert!(factory.get("a").await.is_none());
        assert!(cache.get_account("a").await.unwrap().is_none());

        let new = factory.get_or_create(&config).await.unwrap();
        assert!(!new.same_instance(&old));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_password_auth_rejected_for_rest_providers() {
        let mut config = outlook("a");
        config.auth = AuthMethod::Password;

        let result = ProviderBackends.build(&config, &config.to_account());
        assert!(result.is_err());
    }
}
