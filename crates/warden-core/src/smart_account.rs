//! ERC-4337 smart account resolution
//!
//! The smart account address is a pure function of the owner address, the
//! SimpleAccountFactory and a salt, so it is known before the account is ever
//! deployed. Deployment status is a best-effort probe (`eth_getCode`) and
//! never touches session state.
//!
//! Only public data flows through here: the resolver sees the owner address,
//! never the secret it was derived from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::WardenConfig;
use crate::error::{NetworkError, Result, WardenError};
use crate::types::{keccak256, Address};

/// EntryPoint v0.6
pub const ENTRY_POINT_V06: Address = Address::new([
    0x5f, 0xf1, 0x37, 0xd4, 0xb0, 0xfd, 0xcd, 0x49, 0xdc, 0xa3, 0x0c, 0x7c, 0xf5, 0x7e, 0x57, 0x8a,
    0x02, 0x6d, 0x27, 0x89,
]);

/// SimpleAccountFactory deployed for EntryPoint v0.6
pub const SIMPLE_ACCOUNT_FACTORY: Address = Address::new([
    0x94, 0x06, 0xcc, 0x61, 0x85, 0xa3, 0x46, 0x90, 0x62, 0x96, 0x84, 0x07, 0x46, 0x12, 0x5a, 0x0e,
    0x44, 0x97, 0x64, 0x54,
]);

/// Chains with a known factory deployment
pub const SUPPORTED_CHAINS: [u64; 7] = [1, 10, 137, 1135, 4202, 8453, 42161];

/// `createAccount(address,uint256)`
const CREATE_ACCOUNT_SELECTOR: [u8; 4] = [0x5f, 0xbf, 0xb9, 0xcf];

/// RPC request timeout
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory and salt used to derive a smart account
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FactoryConfig {
    pub chain_id: u64,
    pub factory: Address,
    pub salt: u64,
}

impl FactoryConfig {
    /// Look up the factory for `chain_id`
    pub fn for_chain(chain_id: u64, salt: u64) -> Result<Self> {
        if !SUPPORTED_CHAINS.contains(&chain_id) {
            return Err(WardenError::Config(format!(
                "Smart account factory not available on chain {}",
                chain_id
            )));
        }

        Ok(Self {
            chain_id,
            factory: SIMPLE_ACCOUNT_FACTORY,
            salt,
        })
    }

    /// Use `factory` when given, the chain table otherwise
    pub fn with_override(chain_id: u64, factory: Option<Address>, salt: u64) -> Result<Self> {
        match factory {
            Some(factory) => Ok(Self {
                chain_id,
                factory,
                salt,
            }),
            None => Self::for_chain(chain_id, salt),
        }
    }

    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        Self::with_override(config.chain_id, config.factory, config.account_salt)
    }

    fn salt_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&self.salt.to_be_bytes());
        word
    }
}

/// Counterfactual account address for `owner`.
///
/// `keccak256(0xff ‖ factory ‖ salt ‖ keccak256(owner ‖ salt))[12..]`, with
/// owner and salt as 32-byte words.
pub fn predict_address(owner: &Address, config: &FactoryConfig) -> Address {
    let salt = config.salt_word();

    let mut init = [0u8; 64];
    init[..32].copy_from_slice(&owner.to_word());
    init[32..].copy_from_slice(&salt);
    let init_code_hash = keccak256(&init);

    let mut preimage = [0u8; 85];
    preimage[0] = 0xff;
    preimage[1..21].copy_from_slice(config.factory.as_bytes());
    preimage[21..53].copy_from_slice(&salt);
    preimage[53..].copy_from_slice(&init_code_hash);

    let hash = keccak256(&preimage);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash[12..]);
    Address::new(bytes)
}

/// ERC-4337 `initCode` for the first UserOperation:
/// `factory ‖ createAccount(owner, salt)`
pub fn init_code(owner: &Address, config: &FactoryConfig) -> Vec<u8> {
    let mut code = Vec::with_capacity(20 + 4 + 32 + 32);
    code.extend_from_slice(config.factory.as_bytes());
    code.extend_from_slice(&CREATE_ACCOUNT_SELECTOR);
    code.extend_from_slice(&owner.to_word());
    code.extend_from_slice(&config.salt_word());
    code
}

/// Read-only chain access needed for deployment probes
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Contract bytecode at `address` (empty when nothing is deployed)
    async fn get_code(&self, address: &Address) -> std::result::Result<Vec<u8>, NetworkError>;
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// [`ChainClient`] over HTTP JSON-RPC
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, NetworkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(RPC_TIMEOUT)
            .header(
                "User-Agent",
                format!("warden-core/{}", env!("CARGO_PKG_VERSION")),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| NetworkError::Request {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Request {
                url: self.url.clone(),
                reason: format!("HTTP status {}", status.as_u16()),
            });
        }

        let reply: RpcResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::Malformed(e.to_string()))?;

        if let Some(error) = reply.error {
            return Err(NetworkError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        reply
            .result
            .ok_or_else(|| NetworkError::Malformed("response has neither result nor error".into()))
    }
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn get_code(&self, address: &Address) -> std::result::Result<Vec<u8>, NetworkError> {
        let result = self
            .call("eth_getCode", json!([address.to_checksum(), "latest"]))
            .await?;

        let code = result
            .as_str()
            .ok_or_else(|| NetworkError::Malformed("eth_getCode result is not a string".into()))?;
        let code = code.strip_prefix("0x").unwrap_or(code);

        hex::decode(code).map_err(|e| NetworkError::Malformed(format!("bad bytecode hex: {}", e)))
    }
}

/// Scripted [`ChainClient`] for tests and offline use
#[derive(Default)]
pub struct StaticChainClient {
    code: Mutex<HashMap<Address, Vec<u8>>>,
    failure: Mutex<Option<NetworkError>>,
    calls: AtomicU32,
}

impl StaticChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `code` is deployed at `address`
    pub fn deploy(&self, address: Address, code: Vec<u8>) {
        self.code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, code);
    }

    /// Fail every call with `error` (or stop failing with `None`)
    pub fn set_failure(&self, error: Option<NetworkError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for StaticChainClient {
    async fn get_code(&self, address: &Address) -> std::result::Result<Vec<u8>, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(error);
        }
        Ok(self
            .code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

/// Derives smart account addresses and caches deployment status
pub struct SmartAccountResolver {
    config: FactoryConfig,
    client: Option<Arc<dyn ChainClient>>,
    resolved: Mutex<HashMap<Address, Address>>,
    deployed: Mutex<HashMap<Address, bool>>,
}

impl SmartAccountResolver {
    pub fn new(config: FactoryConfig, client: Option<Arc<dyn ChainClient>>) -> Self {
        Self {
            config,
            client,
            resolved: Mutex::new(HashMap::new()),
            deployed: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Smart account owned by `owner` (cached indefinitely)
    pub fn resolve(&self, owner: &Address) -> Address {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        *resolved.entry(*owner).or_insert_with(|| {
            let account = predict_address(owner, &self.config);
            info!(
                "Predicted smart account {} for owner {} on chain {}",
                account, owner, self.config.chain_id
            );
            account
        })
    }

    /// `initCode` for deploying the account owned by `owner`
    pub fn init_code(&self, owner: &Address) -> Vec<u8> {
        init_code(owner, &self.config)
    }

    /// Last known deployment status, if ever probed
    pub fn cached_deployment(&self, account: &Address) -> Option<bool> {
        self.deployed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account)
            .copied()
    }

    /// Probe the chain for deployed code at `account`.
    ///
    /// Once an account is seen deployed it stays deployed, so later probes
    /// are answered from the cache.
    pub async fn refresh(&self, account: &Address) -> std::result::Result<bool, NetworkError> {
        if self.cached_deployment(account) == Some(true) {
            return Ok(true);
        }

        let client = self.client.as_ref().ok_or(NetworkError::NotConfigured)?;
        let code = match client.get_code(account).await {
            Ok(code) => code,
            Err(e) => {
                warn!("Deployment probe for {} failed: {}", account, e);
                return Err(e);
            }
        };

        let is_deployed = !code.is_empty();
        debug!("Smart account {} deployed: {}", account, is_deployed);
        self.deployed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(*account, is_deployed);
        Ok(is_deployed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn owner() -> Address {
        Address::parse("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap()
    }

    fn lisk_sepolia() -> FactoryConfig {
        FactoryConfig::for_chain(4202, 0).unwrap()
    }

    #[test]
    fn test_constants_match_checksums() {
        assert_eq!(
            ENTRY_POINT_V06.to_checksum(),
            "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
        );
        assert_eq!(
            SIMPLE_ACCOUNT_FACTORY.to_checksum(),
            "0x9406Cc6185a346906296840746125a0E44976454"
        );
    }

    #[test]
    fn test_factory_table() {
        for chain in SUPPORTED_CHAINS {
            assert_eq!(FactoryConfig::for_chain(chain, 0).unwrap().factory, SIMPLE_ACCOUNT_FACTORY);
        }
        assert!(matches!(
            FactoryConfig::for_chain(31337, 0),
            Err(WardenError::Config(_))
        ));

        let custom = Address::new([0xab; 20]);
        let config = FactoryConfig::with_override(31337, Some(custom), 7).unwrap();
        assert_eq!(config.factory, custom);
        assert_eq!(config.salt, 7);
    }

    #[test]
    fn test_prediction_matches_create2_layout() {
        let config = lisk_sepolia();

        let mut init = Vec::new();
        init.extend_from_slice(&owner().to_word());
        init.extend_from_slice(&[0u8; 32]);
        let init_code_hash = keccak256(&init);

        let mut preimage = vec![0xff];
        preimage.extend_from_slice(SIMPLE_ACCOUNT_FACTORY.as_bytes());
        preimage.extend_from_slice(&[0u8; 32]);
        preimage.extend_from_slice(&init_code_hash);
        let expected = &keccak256(&preimage)[12..];

        assert_eq!(predict_address(&owner(), &config).as_bytes(), expected);
    }

    #[test]
    fn test_prediction_is_deterministic() {
        let config = lisk_sepolia();
        let a = predict_address(&owner(), &config);
        assert_eq!(a, predict_address(&owner(), &config));

        let salted = FactoryConfig { salt: 1, ..config };
        assert_ne!(a, predict_address(&owner(), &salted));
        assert_ne!(a, predict_address(&Address::new([1; 20]), &config));
    }

    #[test]
    fn test_init_code_layout() {
        let config = FactoryConfig { salt: 5, ..lisk_sepolia() };
        let code = init_code(&owner(), &config);

        assert_eq!(code.len(), 88);
        assert_eq!(&code[..20], SIMPLE_ACCOUNT_FACTORY.as_bytes());
        assert_eq!(&code[20..24], &CREATE_ACCOUNT_SELECTOR);
        assert_eq!(&code[24..56], &owner().to_word());
        assert_eq!(code[87], 5);
    }

    #[tokio::test]
    async fn test_resolver_caches() {
        let client = Arc::new(StaticChainClient::new());
        let resolver = SmartAccountResolver::new(lisk_sepolia(), Some(client.clone()));

        let account = resolver.resolve(&owner());
        assert_eq!(resolver.resolve(&owner()), account);
        assert_eq!(resolver.cached_deployment(&account), None);

        assert!(!resolver.refresh(&account).await.unwrap());
        assert_eq!(resolver.cached_deployment(&account), Some(false));

        client.deploy(account, vec![0x60, 0x80]);
        assert!(resolver.refresh(&account).await.unwrap());
        assert!(resolver.refresh(&account).await.unwrap());
        // Deployed accounts are not probed again
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_without_client() {
        let resolver = SmartAccountResolver::new(lisk_sepolia(), None);
        let account = resolver.resolve(&owner());
        assert_eq!(resolver.refresh(&account).await, Err(NetworkError::NotConfigured));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_cache() {
        let client = Arc::new(StaticChainClient::new());
        let resolver = SmartAccountResolver::new(lisk_sepolia(), Some(client.clone()));
        let account = resolver.resolve(&owner());

        client.set_failure(Some(NetworkError::Malformed("boom".into())));
        assert!(resolver.refresh(&account).await.is_err());
        assert_eq!(resolver.cached_deployment(&account), None);
    }

    #[tokio::test]
    async fn test_json_rpc_get_code_deployed() {
        let mut mock_server = mockito::Server::new_async().await;

        mock_server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "method": "eth_getCode",
                "params": [owner().to_checksum(), "latest"],
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x6080604052"}"#)
            .create_async()
            .await;

        let client = JsonRpcClient::new(mock_server.url());
        let code = client.get_code(&owner()).await.unwrap();

        drop(mock_server);

        assert_eq!(code, vec![0x60, 0x80, 0x60, 0x40, 0x52]);
    }

    #[tokio::test]
    async fn test_json_rpc_empty_code() {
        let mut mock_server = mockito::Server::new_async().await;

        mock_server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x"}"#)
            .create_async()
            .await;

        let client = JsonRpcClient::new(mock_server.url());
        assert!(client.get_code(&owner()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_rpc_error_object() {
        let mut mock_server = mockito::Server::new_async().await;

        mock_server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#)
            .create_async()
            .await;

        let client = JsonRpcClient::new(mock_server.url());
        assert_eq!(
            client.get_code(&owner()).await,
            Err(NetworkError::Rpc {
                code: -32000,
                message: "header not found".into()
            })
        );
    }

    #[tokio::test]
    async fn test_json_rpc_http_error() {
        let mut mock_server = mockito::Server::new_async().await;

        mock_server
            .mock("POST", "/")
            .with_status(503)
            .create_async()
            .await;

        let url = mock_server.url();
        let client = JsonRpcClient::new(url.clone());
        match client.get_code(&owner()).await {
            Err(NetworkError::Request { url: failed, reason }) => {
                assert_eq!(failed, url);
                assert!(reason.contains("503"));
            }
            other => panic!("Expected request error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_json_rpc_malformed() {
        let mut mock_server = mockito::Server::new_async().await;

        mock_server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":42}"#)
            .create_async()
            .await;

        let client = JsonRpcClient::new(mock_server.url());
        assert!(matches!(
            client.get_code(&owner()).await,
            Err(NetworkError::Malformed(_))
        ));
    }
}
