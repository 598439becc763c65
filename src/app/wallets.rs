//! Wallet lifecycle service.
//!
//! Creates custodial wallets through the signing service, claims inbound
//! wallets for payments, keeps deposit subscriptions alive and reserves
//! nonces for outgoing transactions.

use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::domain::{
    Amount, AppError, Blockchain, Currency, FeeEstimate, LockKey, SigningClient, SigningRequest,
    Wallet, WalletError, WalletLock, WalletStore, WalletSubscriber, WalletType,
};

/// Application service for wallet provisioning and claims
pub struct Wallets {
    store: Arc<dyn WalletStore>,
    signer: Arc<dyn SigningClient>,
    subscriber: Arc<dyn WalletSubscriber>,
}

impl Wallets {
    #[must_use]
    pub fn new(
        store: Arc<dyn WalletStore>,
        signer: Arc<dyn SigningClient>,
        subscriber: Arc<dyn WalletSubscriber>,
    ) -> Self {
        Self {
            store,
            signer,
            subscriber,
        }
    }

    #[instrument(skip(self))]
    pub async fn wallet(&self, wallet_id: i64) -> Result<Wallet, AppError> {
        self.store.get_wallet(wallet_id).await?.ok_or_else(|| {
            AppError::Wallet(WalletError::NotFound(format!("id {wallet_id}")))
        })
    }

    #[instrument(skip(self))]
    pub async fn outbound_wallet(&self, blockchain: Blockchain) -> Result<Wallet, AppError> {
        self.store
            .get_outbound_wallet(blockchain)
            .await?
            .ok_or_else(|| {
                AppError::Wallet(WalletError::NoOutboundWallet(blockchain.to_string()))
            })
    }

    /// Create a wallet: the signing service generates the key, we persist
    /// only its UUID and address.
    #[instrument(skip(self), fields(blockchain = %blockchain))]
    pub async fn create_wallet(
        &self,
        blockchain: Blockchain,
        wallet_type: WalletType,
    ) -> Result<Wallet, AppError> {
        let created = self.signer.create_wallet(blockchain).await?;
        let wallet = self
            .store
            .create_wallet(blockchain, wallet_type, created.uuid, &created.address)
            .await?;
        info!(
            wallet_id = wallet.id,
            address = %wallet.address,
            "Created {wallet_type} wallet"
        );
        Ok(wallet)
    }

    /// Claim an inbound wallet for a payment, provisioning a fresh one when
    /// every existing wallet is already locked for this currency.
    #[instrument(skip(self, currency), fields(ticker = currency.ticker, blockchain = %currency.blockchain))]
    pub async fn acquire_wallet(
        &self,
        merchant_id: i64,
        currency: &Currency,
        is_test: bool,
    ) -> Result<(Wallet, WalletLock), AppError> {
        let network_id = currency.network_id(is_test);

        if let Some(acquired) = self
            .store
            .acquire_available_wallet(merchant_id, currency.blockchain, currency.ticker, network_id)
            .await?
        {
            return Ok(acquired);
        }

        info!(
            blockchain = %currency.blockchain,
            "No free inbound wallet, provisioning a new one"
        );
        let wallet = self
            .create_wallet(currency.blockchain, WalletType::Inbound)
            .await?;

        match self
            .store
            .lock_wallet(wallet.id, merchant_id, currency.ticker, network_id)
            .await
        {
            Ok(lock) => Ok((wallet, lock)),
            // A concurrent payment grabbed the fresh wallet between insert
            // and lock. It freed up whichever wallet it was waiting on, so
            // one more sweep is enough.
            Err(AppError::Wallet(WalletError::AlreadyLocked { .. })) => self
                .store
                .acquire_available_wallet(
                    merchant_id,
                    currency.blockchain,
                    currency.ticker,
                    network_id,
                )
                .await?
                .ok_or_else(|| {
                    AppError::Wallet(WalletError::AlreadyLocked {
                        wallet_id: wallet.id,
                        currency: currency.ticker.to_string(),
                        network_id,
                    })
                }),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, key), fields(wallet_id = key.wallet_id, currency = %key.currency))]
    pub async fn release_wallet(&self, key: &LockKey) -> Result<(), AppError> {
        self.store.release_lock(key).await
    }

    /// Subscribe the wallet to deposit notifications unless it already is
    #[instrument(skip(self, wallet), fields(wallet_id = wallet.id))]
    pub async fn ensure_subscription(&self, wallet: &Wallet, is_test: bool) -> Result<(), AppError> {
        if wallet.subscription_id(is_test).is_some() {
            return Ok(());
        }

        let subscription_id = self.subscriber.subscribe(wallet, is_test).await?;
        self.store
            .set_subscription_id(wallet.id, is_test, &subscription_id)
            .await?;
        info!(
            wallet_id = wallet.id,
            subscription_id = %subscription_id,
            "Subscribed wallet to deposit notifications"
        );
        Ok(())
    }

    /// Reserve a nonce and sign an outgoing transaction.
    ///
    /// The nonce stays pending until the broadcast outcome is known. A
    /// signing failure rolls it back immediately so the sequence has no gap.
    #[instrument(skip_all, fields(wallet_id = wallet.id, ticker = currency.ticker, recipient = %recipient))]
    pub async fn create_signed_transaction(
        &self,
        wallet: &Wallet,
        currency: &Currency,
        is_test: bool,
        amount: Amount,
        recipient: &str,
        fee: FeeEstimate,
    ) -> Result<(String, i64), AppError> {
        let nonce = self.store.increment_pending_nonce(wallet.id, is_test).await?;

        let request = SigningRequest {
            wallet_uuid: wallet.uuid,
            blockchain: currency.blockchain,
            is_test,
            asset_type: currency.currency_type,
            contract_address: currency.contract(is_test).map(str::to_string),
            amount,
            recipient: recipient.to_string(),
            network_id: currency.network_id(is_test),
            nonce,
            fee,
        };

        match self.signer.sign_transaction(&request).await {
            Ok(raw) => Ok((raw, nonce)),
            Err(e) => {
                if let Err(rollback_err) =
                    self.store.rollback_pending_nonce(wallet.id, is_test).await
                {
                    error!(
                        error = %rollback_err,
                        wallet_id = wallet.id,
                        "Failed to roll back pending nonce after signing error"
                    );
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn confirm_pending_nonce(
        &self,
        wallet_id: i64,
        is_test: bool,
    ) -> Result<(), AppError> {
        self.store.confirm_pending_nonce(wallet_id, is_test).await
    }

    #[instrument(skip(self))]
    pub async fn rollback_pending_nonce(
        &self,
        wallet_id: i64,
        is_test: bool,
    ) -> Result<(), AppError> {
        self.store.rollback_pending_nonce(wallet_id, is_test).await
    }

    #[instrument(skip(self))]
    pub async fn wallet_by_uuid(&self, uuid: &Uuid) -> Result<Option<Wallet>, AppError> {
        self.store.get_wallet_by_uuid(uuid).await
    }
}
