//! HTTP API for redemptions, verification and the points ledger
//!
//! ## Family app
//! - `POST /redemptions` - Redeem an in-person reward
//! - `GET /redemptions/{id}` - Read a redemption
//! - `POST /redemptions/{id}/cancel` - Cancel a pending redemption
//! - `GET /families/{id}/redemptions` - A family's redemptions
//! - `GET /families/{id}/ledger` - Points history across family members
//! - `POST /affiliate/clicks` - Track an affiliate click and spend points
//! - `GET /affiliate/clicks/{id}` - Read a recorded click
//!
//! ## Business portal
//! - `POST /redemptions/verify` - Verify and fulfill a code
//! - `GET /businesses/{id}/redemptions` - Redemptions issued for a business
//!
//! ## Admin
//! - `POST /redemptions/sweep` - Expire overdue pending redemptions
//! - `PUT|GET /rewards/{id}`, `PUT|GET /businesses/{id}` - Directory upserts
//! - `POST /ledger/earn` - Credit points
//! - `GET /ledger/{user}/balance`, `GET /ledger/{user}/entries` - Ledger reads
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST http://localhost:8095/redemptions/verify \
//!      -H "Content-Type: application/json" \
//!      -d '{"redemptionCode":"ABCD-EFGH-JKMN","businessId":"biz-1","verifiedBy":"Sam"}'
//! ```

use crate::error::{RedemptionError, StorageError};
use crate::models::{Business, Reward};
use crate::services::{
    error_response, from_create_result, from_option, from_result, not_found, ok,
    CancelRedemptionRequest, CreateRedemptionRequest, EarnRequest, Services,
    TrackAffiliateClickRequest, VerifyRedemptionRequest,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self { services, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), StorageError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, hyper::Error>
    where
        B: Body,
        B::Error: Display,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let services = &self.services;

        let response = match (method, segments.as_slice()) {
            // Health check
            (Method::GET, ["health"]) => self.handle_health().await,

            // Redemption lifecycle
            (Method::POST, ["redemptions"]) => match read_json::<CreateRedemptionRequest, _>(req).await {
                Ok(body) => from_create_result(services.redemptions.create_redemption(body).await),
                Err(e) => error_response(e),
            },
            (Method::POST, ["redemptions", "verify"]) => {
                match read_json::<VerifyRedemptionRequest, _>(req).await {
                    Ok(body) => from_result(services.verification.verify(body).await),
                    Err(e) => error_response(e),
                }
            }
            (Method::POST, ["redemptions", "sweep"]) => {
                let expired = services.redemptions.expire_stale().await;
                from_result(expired.map(|n| serde_json::json!({ "expired": n })))
            }
            (Method::GET, ["redemptions", id]) => from_result(services.redemptions.get(id).await),
            (Method::POST, ["redemptions", id, "cancel"]) => {
                match read_json_or_default::<CancelRedemptionRequest, _>(req).await {
                    Ok(body) => from_result(services.redemptions.cancel(id, body).await),
                    Err(e) => error_response(e),
                }
            }
            (Method::GET, ["families", id, "redemptions"]) => {
                from_result(services.redemptions.list_for_family(id).await)
            }
            (Method::GET, ["families", id, "ledger"]) => {
                from_result(services.ledger.family_history(id).await)
            }
            (Method::GET, ["businesses", id, "redemptions"]) => {
                from_result(services.redemptions.list_for_business(id).await)
            }

            // Directories
            (Method::GET, ["businesses", id]) => from_option(
                services.stores.businesses.get_business(id).await.map_err(Into::into),
                "Business not found",
            ),
            (Method::PUT, ["businesses", id]) => match read_json::<Business, _>(req).await {
                Ok(mut business) => {
                    business.id = id.to_string();
                    let stored = services.stores.businesses.put_business(&business).await;
                    from_result(stored.map(|_| business).map_err(RedemptionError::from))
                }
                Err(e) => error_response(e),
            },
            (Method::GET, ["rewards", id]) => from_option(
                services.stores.rewards.get_reward(id).await.map_err(Into::into),
                "Reward not found",
            ),
            (Method::PUT, ["rewards", id]) => match read_json::<Reward, _>(req).await {
                Ok(mut reward) => {
                    reward.id = id.to_string();
                    let stored = services.stores.rewards.put_reward(&reward).await;
                    from_result(stored.map(|_| reward).map_err(RedemptionError::from))
                }
                Err(e) => error_response(e),
            },

            // Ledger
            (Method::POST, ["ledger", "earn"]) => match read_json::<EarnRequest, _>(req).await {
                Ok(body) => {
                    let result = services
                        .ledger
                        .record_earn(&body.user_id, &body.family_id, body.amount, body.source())
                        .await;
                    from_create_result(result.map(|entry_id| serde_json::json!({ "entryId": entry_id })))
                }
                Err(e) => error_response(e),
            },
            (Method::GET, ["ledger", user, "balance"]) => {
                let balance = services.ledger.get_balance(user).await;
                from_result(balance.map(|b| serde_json::json!({ "userId": user, "balance": b })))
            }
            (Method::GET, ["ledger", user, "entries"]) => {
                from_result(services.ledger.history(user).await)
            }

            // Affiliate
            (Method::POST, ["affiliate", "clicks"]) => {
                match read_json::<TrackAffiliateClickRequest, _>(req).await {
                    Ok(body) => from_create_result(services.affiliate.track_click(body).await),
                    Err(e) => error_response(e),
                }
            }
            (Method::GET, ["affiliate", "clicks", id]) => from_option(
                services.stores.affiliate_clicks.get_click(id).await.map_err(Into::into),
                "Affiliate click not found",
            ),

            // Not found
            _ => not_found("Not Found"),
        };

        Ok(response)
    }

    /// Health check endpoint
    async fn handle_health(&self) -> Response<Full<Bytes>> {
        match self.services.stores.redemptions.count().await {
            Ok(redemptions) => ok(&serde_json::json!({
                "status": "ok",
                "redemptions": redemptions,
                "subscribers": self.services.events.subscriber_count(),
            })),
            Err(e) => error_response(e.into()),
        }
    }
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes, RedemptionError>
where
    B: Body,
    B::Error: Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| RedemptionError::InvalidInput(format!("Failed to read body: {}", e)))?;
    Ok(body.to_bytes())
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, RedemptionError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Display,
{
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RedemptionError::InvalidInput(format!("Invalid JSON body: {}", e)))
}

/// An empty body means "no options"
async fn read_json_or_default<T, B>(req: Request<B>) -> Result<T, RedemptionError>
where
    T: DeserializeOwned + Default,
    B: Body,
    B::Error: Display,
{
    let bytes = read_body(req).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| RedemptionError::InvalidInput(format!("Invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RedemptionPolicy;
    use crate::store::Stores;
    use hyper::StatusCode;
    use serde_json::{json, Value};

    fn server() -> HttpServer {
        let services = Services::new(
            Stores::in_memory(),
            Arc::new(ManualClock::new(chrono::Utc::now())),
            RedemptionPolicy::default(),
        );
        HttpServer::new(Arc::new(services), "127.0.0.1:0".parse().unwrap())
    }

    async fn call(server: &HttpServer, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        let resp = server.handle_request(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn seed(server: &HttpServer) {
        let (status, _) = call(
            server,
            Method::PUT,
            "/businesses/biz-1",
            Some(json!({ "id": "ignored", "name": "Scoops" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            server,
            Method::PUT,
            "/rewards/r1",
            Some(json!({
                "id": "r1", "title": "Free Cone", "pointCost": 100,
                "status": "ACTIVE", "businessId": "biz-1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health() {
        let server = server();
        let (status, body) = call(&server, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["redemptions"], 0);
    }

    #[tokio::test]
    async fn test_redeem_then_verify_over_http() {
        let server = server();
        seed(&server).await;

        let (status, receipt) = call(
            &server,
            Method::POST,
            "/redemptions",
            Some(json!({
                "rewardId": "r1", "userId": "kid-1", "familyId": "fam-1", "pointsToSpend": 100
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(receipt["businessName"], "Scoops");
        let code = receipt["redemptionCode"].as_str().unwrap().to_string();

        let verify = json!({ "redemptionCode": code, "businessId": "biz-1", "verifiedBy": "Sam" });
        let (status, body) = call(&server, Method::POST, "/redemptions/verify", Some(verify.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["redemption"]["status"], "REDEEMED");

        let (status, body) = call(&server, Method::POST, "/redemptions/verify", Some(verify)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "ALREADY_FULFILLED");

        let (_, balance) = call(&server, Method::GET, "/ledger/kid-1/balance", None).await;
        assert_eq!(balance["balance"], -100);
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_statuses() {
        let server = server();
        seed(&server).await;

        let (status, body) = call(
            &server,
            Method::POST,
            "/redemptions",
            Some(json!({
                "rewardId": "r1", "userId": "kid-1", "familyId": "fam-1", "pointsToSpend": 50
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "POINTS_MISMATCH");

        let (status, body) = call(
            &server,
            Method::POST,
            "/redemptions/verify",
            Some(json!({ "redemptionCode": "AAAA-BBBB-CCCC", "businessId": "biz-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "CODE_NOT_FOUND");

        let (status, _) = call(&server, Method::GET, "/redemptions/redeem-missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let server = server();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/redemptions")
            .body(Full::new(Bytes::from_static(b"{not json")))
            .unwrap();
        let resp = server.handle_request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_with_empty_body_refunds() {
        let server = server();
        seed(&server).await;

        let (_, receipt) = call(
            &server,
            Method::POST,
            "/redemptions",
            Some(json!({
                "rewardId": "r1", "userId": "kid-1", "familyId": "fam-1", "pointsToSpend": 100
            })),
        )
        .await;
        let id = receipt["redemptionId"].as_str().unwrap().to_string();

        let (status, body) = call(&server, Method::POST, &format!("/redemptions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "CANCELLED");

        let (_, balance) = call(&server, Method::GET, "/ledger/kid-1/balance", None).await;
        assert_eq!(balance["balance"], 0);

        let (status, body) = call(&server, Method::POST, &format!("/redemptions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_earn_and_entries() {
        let server = server();
        let (status, body) = call(
            &server,
            Method::POST,
            "/ledger/earn",
            Some(json!({ "userId": "kid-1", "familyId": "fam-1", "amount": 25, "sourceId": "job-9" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["entryId"].as_str().unwrap().starts_with("pt-"));

        let (_, entries) = call(&server, Method::GET, "/ledger/kid-1/entries", None).await;
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["sourceKind"], "JOB");

        let (_, family) = call(&server, Method::GET, "/families/fam-1/ledger", None).await;
        assert_eq!(family[0]["amount"], 25);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let server = server();
        let (status, _) = call(&server, Method::DELETE, "/redemptions", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
