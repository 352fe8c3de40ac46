//! Routes one push to the right transport and applies the delivery outcome.
//!
//! The dispatcher owns no state; it coordinates the store, the hub and the
//! provider client. Android messages are persisted eagerly: the outbox row
//! exists before any transport attempt, and only the device's ack (or the
//! provider's 2xx on the iOS side, where nothing is persisted) flips
//! `delivered`.

use std::sync::Arc;

use uuid::Uuid;

use crate::apns::{ApnsAlert, ApnsClient, ApnsPayload, Aps};
use crate::crypto;
use crate::error::AppError;
use crate::hub::wire::WireMessage;
use crate::hub::Hub;
use crate::metrics;
use crate::models::{Device, DeviceKind, PushOutcome, PushRequest};
use crate::store::{NewMessage, Store};

const APNS_CATEGORY: &str = "myNotificationCategory";
const DEFAULT_SOUND: &str = "1107.caf";
const CALL_SOUND: &str = "alarm.caf";

#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    hub: Hub,
    apns: Option<Arc<ApnsClient>>,
}

impl Dispatcher {
    pub fn new(store: Store, hub: Hub, apns: Option<Arc<ApnsClient>>) -> Self {
        Self { store, hub, apns }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn push(
        &self,
        device_key: &str,
        request: &PushRequest,
    ) -> Result<PushOutcome, AppError> {
        let device = self
            .store
            .get_device(device_key)
            .await?
            .ok_or(AppError::DeviceNotFound)?;

        let message_id = Uuid::new_v4().to_string();

        match device.kind {
            DeviceKind::Ios => self.push_ios(&device, request, message_id).await,
            DeviceKind::Android => self.push_android(&device, request, message_id).await,
        }
    }

    /// iOS: the provider is authoritative, nothing is persisted here.
    async fn push_ios(
        &self,
        device: &Device,
        request: &PushRequest,
        message_id: String,
    ) -> Result<PushOutcome, AppError> {
        let Some(apns) = self.apns.as_ref() else {
            return Err(AppError::ProviderUnavailable);
        };
        if device.device_token.is_empty() {
            return Err(AppError::MissingDeviceToken);
        }

        let payload = build_apns_payload(request);
        let collapse_id = (!request.id.is_empty()).then_some(request.id.as_str());

        let response = apns.push(&device.device_token, &payload, collapse_id).await?;
        self.apply_provider_response(device, response, message_id)
            .await
    }

    async fn apply_provider_response(
        &self,
        device: &Device,
        response: crate::apns::ApnsResponse,
        message_id: String,
    ) -> Result<PushOutcome, AppError> {
        if response.is_success() {
            tracing::debug!(
                device_key = %device.device_key,
                apns_id = response.apns_id.as_deref().unwrap_or(""),
                "provider accepted push"
            );
            metrics::record_push("ios", "delivered");
            return Ok(PushOutcome::Delivered { message_id });
        }

        let reason = response.reason.unwrap_or_default();
        if response.status == 410 || reason.contains("BadDeviceToken") {
            // The token is dead; clear it so the next push fails fast.
            self.store
                .update_device_token(&device.device_key, "")
                .await?;
            metrics::record_push("ios", "invalid_token");
            return Err(AppError::InvalidDeviceToken { reason });
        }

        metrics::record_push("ios", "rejected");
        Err(AppError::ProviderRejected {
            status: response.status,
            reason,
        })
    }

    /// Android: persist first, then offer to the live socket.
    async fn push_android(
        &self,
        device: &Device,
        request: &PushRequest,
        message_id: String,
    ) -> Result<PushOutcome, AppError> {
        let visible = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "group": request.group,
            "icon": request.icon,
            "url": request.url,
            "sound": request.sound,
            "badge": request.badge,
            "level": request.level,
            "call": request.call,
            "isArchive": request.is_archive,
        });

        let mut envelope = String::new();
        if !device.public_key.is_empty() {
            match crypto::parse_public_key(&device.public_key)
                .and_then(|key| crypto::encrypt_message(&key, visible.to_string().as_bytes()))
            {
                Ok(encrypted) => envelope = encrypted,
                Err(e) => {
                    // The socket is TLS-terminated; fall back to clear.
                    tracing::warn!(
                        device_key = %device.device_key,
                        error = %e,
                        "payload encryption failed, sending in clear"
                    );
                }
            }
        }

        self.store
            .create_message(&NewMessage {
                device_id: device.id,
                message_id: message_id.clone(),
                title: request.title.clone(),
                body: request.body.clone(),
                group: request.group.clone(),
                icon: request.icon.clone(),
                url: request.url.clone(),
                sound: request.sound.clone(),
                badge: request.badge,
                encrypted_payload: envelope.clone().into_bytes(),
            })
            .await?;

        let wire_data = if envelope.is_empty() {
            visible
        } else {
            serde_json::json!({ "encrypted_content": envelope })
        };
        let frame = WireMessage::message(message_id.clone(), wire_data);

        if self.hub.send_to_device(&device.device_key, &frame).await {
            metrics::record_push("android", "delivered");
            Ok(PushOutcome::Delivered { message_id })
        } else {
            metrics::record_push("android", "queued");
            Ok(PushOutcome::Queued { message_id })
        }
    }
}

/// Provider payload mapping for one request.
fn build_apns_payload(request: &PushRequest) -> ApnsPayload {
    let mut sound = request.sound.clone();
    if !sound.is_empty() && !sound.ends_with(".caf") {
        sound.push_str(".caf");
    }
    if sound.is_empty() {
        sound = DEFAULT_SOUND.into();
    }
    if request.call {
        sound = CALL_SOUND.into();
    }

    ApnsPayload {
        aps: Aps {
            alert: ApnsAlert {
                title: request.title.clone(),
                subtitle: request.subtitle.clone(),
                body: request.body.clone(),
            },
            badge: (request.badge > 0).then_some(request.badge),
            sound,
            thread_id: request.group.clone(),
            category: APNS_CATEGORY.into(),
            mutable_content: 1,
        },
        group: request.group.clone(),
        icon: request.icon.clone(),
        image: request.image.clone(),
        url: request.url.clone(),
        level: request.level.clone(),
        badge: request.badge,
        call: request.call,
        is_archive: request.is_archive,
        delete: request.delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApnsConfig;
    use crate::hub::{Connection, HubConfig};
    use crate::store::NewDevice;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::{EncodePrivateKey, LineEnding};

    async fn dispatcher(apns: Option<Arc<ApnsClient>>) -> Dispatcher {
        let store = Store::connect_in_memory().await.unwrap();
        let hub = Hub::new(store.clone(), HubConfig::default());
        Dispatcher::new(store, hub, apns)
    }

    fn apns_client() -> Arc<ApnsClient> {
        let pem = SigningKey::random(&mut rand::rngs::OsRng)
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap()
            .to_string();
        Arc::new(
            ApnsClient::new(&ApnsConfig {
                key_id: "KEY1234567".into(),
                team_id: "TEAM123456".into(),
                private_key_pem: pem,
                production: false,
                topic: "com.example.app".into(),
            })
            .unwrap(),
        )
    }

    async fn register_device(d: &Dispatcher, key: &str, kind: DeviceKind, token: &str) -> i64 {
        d.store()
            .create_device(&NewDevice {
                device_key: key.into(),
                kind,
                device_token: token.into(),
                public_key: String::new(),
                name: String::new(),
            })
            .await
            .unwrap()
            .id
    }

    fn body_request(body: &str) -> PushRequest {
        PushRequest {
            body: body.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let d = dispatcher(None).await;
        let err = d.push("missing", &body_request("hi")).await.unwrap_err();
        assert!(matches!(err, AppError::DeviceNotFound));
    }

    #[tokio::test]
    async fn ios_without_provider_client() {
        let d = dispatcher(None).await;
        register_device(&d, "ios1", DeviceKind::Ios, "tok").await;
        let err = d.push("ios1", &body_request("hi")).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable));
    }

    #[tokio::test]
    async fn ios_without_token_fails_before_submission() {
        let d = dispatcher(Some(apns_client())).await;
        register_device(&d, "ios2", DeviceKind::Ios, "").await;
        let err = d.push("ios2", &body_request("hi")).await.unwrap_err();
        assert!(matches!(err, AppError::MissingDeviceToken));
    }

    #[tokio::test]
    async fn android_offline_is_queued_and_persisted() {
        let d = dispatcher(None).await;
        let device_id = register_device(&d, "a1", DeviceKind::Android, "").await;

        let outcome = d.push("a1", &body_request("stored")).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Queued { .. }));

        let pending = d.store().get_undelivered(device_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body, "stored");
        assert_eq!(pending[0].message_id, outcome.message_id());
        assert!(pending[0].encrypted_payload.is_empty());
    }

    #[tokio::test]
    async fn android_online_delivers_but_awaits_ack() {
        let d = dispatcher(None).await;
        let device_id = register_device(&d, "a2", DeviceKind::Android, "").await;

        let (conn, mut rx) = Connection::new("a2".into(), device_id, 16);
        d.hub().register(conn).await;
        while !d.hub().is_online("a2").await {
            tokio::task::yield_now().await;
        }

        let outcome = d.push("a2", &body_request("live")).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Delivered { .. }));

        let payload = rx.recv().await.expect("frame");
        let frame = WireMessage::from_json(&payload).unwrap();
        assert_eq!(frame.id.as_deref(), Some(outcome.message_id()));
        assert_eq!(frame.data.unwrap()["body"], "live");

        // Delivered means accepted by the socket; the record stays in the
        // outbox until the device acks.
        assert_eq!(d.store().get_undelivered(device_id).await.unwrap().len(), 1);

        d.store()
            .mark_message_delivered(outcome.message_id())
            .await
            .unwrap();
        assert!(d.store().get_undelivered(device_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn android_with_public_key_gets_envelope() {
        let d = dispatcher(None).await;
        let device = d
            .store()
            .create_device(&NewDevice {
                device_key: "enc".into(),
                kind: DeviceKind::Android,
                device_token: String::new(),
                public_key: test_rsa_public_key(),
                name: String::new(),
            })
            .await
            .unwrap();

        let (conn, mut rx) = Connection::new("enc".into(), device.id, 16);
        d.hub().register(conn).await;
        while !d.hub().is_online("enc").await {
            tokio::task::yield_now().await;
        }

        d.push("enc", &body_request("secret")).await.unwrap();

        let frame = WireMessage::from_json(&rx.recv().await.unwrap()).unwrap();
        let data = frame.data.unwrap();
        assert!(data.get("body").is_none());
        assert!(!data["encrypted_content"].as_str().unwrap().is_empty());

        let pending = d.store().get_undelivered(device.id).await.unwrap();
        assert!(!pending[0].encrypted_payload.is_empty());
    }

    #[tokio::test]
    async fn bad_public_key_falls_back_to_clear() {
        let d = dispatcher(None).await;
        let device = d
            .store()
            .create_device(&NewDevice {
                device_key: "badkey".into(),
                kind: DeviceKind::Android,
                device_token: String::new(),
                public_key: "-----BEGIN PUBLIC KEY-----\nbroken\n-----END PUBLIC KEY-----".into(),
                name: String::new(),
            })
            .await
            .unwrap();

        let (conn, mut rx) = Connection::new("badkey".into(), device.id, 16);
        d.hub().register(conn).await;
        while !d.hub().is_online("badkey").await {
            tokio::task::yield_now().await;
        }

        d.push("badkey", &body_request("clear")).await.unwrap();
        let frame = WireMessage::from_json(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.data.unwrap()["body"], "clear");
    }

    #[tokio::test]
    async fn provider_410_clears_token_and_next_push_fails_fast() {
        use crate::apns::ApnsResponse;

        let d = dispatcher(Some(apns_client())).await;
        register_device(&d, "stale", DeviceKind::Ios, "dead-token").await;
        let device = d.store().get_device("stale").await.unwrap().unwrap();

        let err = d
            .apply_provider_response(
                &device,
                ApnsResponse {
                    status: 410,
                    apns_id: None,
                    reason: Some("Unregistered".into()),
                },
                "mid".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidDeviceToken { .. }));

        let device = d.store().get_device("stale").await.unwrap().unwrap();
        assert!(device.device_token.is_empty());

        // The provider is never contacted again for this device.
        let err = d.push("stale", &body_request("hi")).await.unwrap_err();
        assert!(matches!(err, AppError::MissingDeviceToken));
    }

    #[tokio::test]
    async fn bad_device_token_reason_also_clears() {
        use crate::apns::ApnsResponse;

        let d = dispatcher(Some(apns_client())).await;
        register_device(&d, "badtok", DeviceKind::Ios, "tok").await;
        let device = d.store().get_device("badtok").await.unwrap().unwrap();

        let err = d
            .apply_provider_response(
                &device,
                ApnsResponse {
                    status: 400,
                    apns_id: None,
                    reason: Some("BadDeviceToken".into()),
                },
                "mid".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidDeviceToken { .. }));
        let device = d.store().get_device("badtok").await.unwrap().unwrap();
        assert!(device.device_token.is_empty());
    }

    #[tokio::test]
    async fn other_provider_rejections_keep_token() {
        use crate::apns::ApnsResponse;

        let d = dispatcher(Some(apns_client())).await;
        register_device(&d, "busy", DeviceKind::Ios, "tok").await;
        let device = d.store().get_device("busy").await.unwrap().unwrap();

        let err = d
            .apply_provider_response(
                &device,
                ApnsResponse {
                    status: 429,
                    apns_id: None,
                    reason: Some("TooManyRequests".into()),
                },
                "mid".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ProviderRejected { status: 429, .. }
        ));
        let device = d.store().get_device("busy").await.unwrap().unwrap();
        assert_eq!(device.device_token, "tok");
    }

    #[tokio::test]
    async fn provider_2xx_is_delivered_without_persistence() {
        use crate::apns::ApnsResponse;

        let d = dispatcher(Some(apns_client())).await;
        register_device(&d, "ok-ios", DeviceKind::Ios, "tok").await;
        let device = d.store().get_device("ok-ios").await.unwrap().unwrap();

        let outcome = d
            .apply_provider_response(
                &device,
                ApnsResponse {
                    status: 200,
                    apns_id: Some("apns-1".into()),
                    reason: None,
                },
                "mid".into(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PushOutcome::Delivered { .. }));
        assert!(d.store().get_undelivered(device.id).await.unwrap().is_empty());
    }

    #[test]
    fn payload_sound_mapping() {
        let payload = build_apns_payload(&PushRequest::default());
        assert_eq!(payload.aps.sound, "1107.caf");

        let payload = build_apns_payload(&PushRequest {
            sound: "bell".into(),
            ..Default::default()
        });
        assert_eq!(payload.aps.sound, "bell.caf");

        let payload = build_apns_payload(&PushRequest {
            sound: "bell.caf".into(),
            ..Default::default()
        });
        assert_eq!(payload.aps.sound, "bell.caf");

        let payload = build_apns_payload(&PushRequest {
            sound: "bell".into(),
            call: true,
            ..Default::default()
        });
        assert_eq!(payload.aps.sound, "alarm.caf");
    }

    #[test]
    fn payload_badge_and_group_mapping() {
        let payload = build_apns_payload(&PushRequest {
            group: "ci".into(),
            badge: 0,
            ..Default::default()
        });
        assert_eq!(payload.aps.thread_id, "ci");
        assert_eq!(payload.group, "ci");
        assert!(payload.aps.badge.is_none());
        assert_eq!(payload.aps.category, "myNotificationCategory");
        assert_eq!(payload.aps.mutable_content, 1);

        let payload = build_apns_payload(&PushRequest {
            badge: 5,
            ..Default::default()
        });
        assert_eq!(payload.aps.badge, Some(5));
    }

    fn test_rsa_public_key() -> String {
        "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA5pNmaXnZzGdiw1IHaSnT
RIHQemfLG3BxsDfv1IxEBgyV6YpWj0CFYxrbW1W2fpfdSHb0Ncf3MDerGdPkfLyE
4YyXGh0XpT50ZnLEHruY7TwP+sfIfI6b872BFwmd0CPRXtba5yNylG0zklmaV0aF
i5W4B+MFI03/R+sisNdYjXeVEvQ27y1FNBfJ6Fqr1ZPM6qAeWiaLDDXVvFTKET/e
B4u0+dccKapG9xAS1kY2Ut4nMlB1qTxQgk0bCEW5L2etklOCvcvSSDnlqWWctUjs
a6MG6lCObfu2shOvkY+BkQYf89KxATuJBgJZ+/rd0/H+BygPLbRVsfYJYOgk1Dfc
JwIDAQAB
-----END PUBLIC KEY-----"
            .to_string()
    }
}
