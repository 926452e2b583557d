use std::sync::Arc;

use chrono::{DateTime, Utc};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

use pfpk_service::api::create_router;
use pfpk_service::auth::{parse_auth, sign_doc_bytes};
use pfpk_service::crypto::{PublicKey, COSMOS_SECP256K1};
use pfpk_service::types::SignedRequest;
use pfpk_service::{AppState, Config};

/// A cosmos wallet that signs PFPK envelopes on juno-1
pub struct TestWallet {
    key: SigningKey,
    pub public_key: PublicKey,
}

impl TestWallet {
    pub fn random() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let hex = hex::encode(key.verifying_key().to_encoded_point(true).as_bytes());
        let public_key = PublicKey::new(COSMOS_SECP256K1, &hex).expect("valid key");
        Self { key, public_key }
    }

    pub fn hex(&self) -> &str {
        self.public_key.hex()
    }

    pub fn address(&self, prefix: &str) -> String {
        self.public_key.bech32_address(prefix).expect("valid prefix")
    }

    pub fn key_ref(&self) -> Value {
        json!({ "type": COSMOS_SECP256K1, "hex": self.hex() })
    }

    /// Envelope signed now
    pub fn sign(&self, body: Value, nonce: u64) -> SignedRequest {
        self.sign_at(body, nonce, Utc::now())
    }

    pub fn sign_at(&self, body: Value, nonce: u64, timestamp: DateTime<Utc>) -> SignedRequest {
        let mut data = body.as_object().cloned().unwrap_or_default();
        data.insert(
            "auth".into(),
            json!({
                "type": "PFPK",
                "nonce": nonce,
                "chainId": "juno-1",
                "chainFeeDenom": "ujuno",
                "chainBech32Prefix": "juno",
                "publicKeyType": COSMOS_SECP256K1,
                "publicKeyHex": self.hex(),
                "timestamp": timestamp.timestamp_millis(),
            }),
        );
        let data = Value::Object(data);

        let auth = parse_auth(&data).expect("valid auth");
        let message = sign_doc_bytes(&auth, &self.address("juno"), &data).expect("sign doc");
        let digest = Sha256::digest(Sha256::digest(&message));
        let signature: Signature = self.key.sign_prehash(&digest).expect("signing");
        let signature = signature.normalize_s().unwrap_or(signature);

        SignedRequest {
            data,
            signature: Some(base64_encode(&signature.to_bytes())),
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Test client for API calls
pub struct TestClient {
    pub base_url: String,
    pub client: Client,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("Failed to send request");
        read(resp).await
    }

    pub async fn get_with_bearer(&self, path: &str, token: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .expect("Failed to send request");
        read(resp).await
    }

    pub async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .expect("Failed to send request");
        read(resp).await
    }
}

async fn read(resp: reqwest::Response) -> (StatusCode, Value) {
    let status = resp.status();
    let body = resp.json().await.expect("JSON body");
    (status, body)
}

/// Start a test server on a random port
pub async fn start_test_server() -> (TestClient, Arc<AppState>) {
    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        jwt_secret: "integration-test-secret".into(),
        ..Config::from_env()
    };
    let state = AppState::in_memory(config);
    let app = create_router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    // Wait for server to be ready
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    (TestClient::new(format!("http://{}", addr)), state)
}
