//! Immutable camera registry.
//!
//! Built once from the configuration before any task starts and shared
//! read-only afterwards, so lookups need no lock.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::camera::{Camera, CameraSettings};
use crate::error::{NvrError, Result};

/// All configured cameras, keyed by id.
#[derive(Default, Clone)]
pub struct Registry {
    cameras: BTreeMap<String, Arc<Camera>>,
}

impl Registry {
    /// Create a camera, with its own live track and a child of `cancel`,
    /// for every settings entry.
    pub fn new(settings: Vec<CameraSettings>, cancel: &CancellationToken) -> Self {
        let cameras = settings
            .into_iter()
            .map(|settings| {
                let id = settings.id.clone();
                let camera =
                    Camera::new(settings, Arc::new(live_track()), cancel.child_token());
                (id, Arc::new(camera))
            })
            .collect();
        Self { cameras }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Camera>> {
        self.cameras.get(id)
    }

    /// Look up a camera on behalf of `ip`.
    ///
    /// Unknown ids and addresses the camera's access list rejects both yield
    /// [`NvrError::CameraNotFound`].
    pub fn resolve(&self, id: &str, ip: IpAddr) -> Result<&Arc<Camera>> {
        match self.cameras.get(id) {
            Some(camera) if camera.acl().allows(ip) => Ok(camera),
            _ => Err(NvrError::CameraNotFound(id.to_string())),
        }
    }

    /// Ids of the cameras `ip` may access, sorted.
    pub fn visible_ids(&self, ip: IpAddr) -> Vec<String> {
        self.cameras
            .values()
            .filter(|camera| camera.acl().allows(ip))
            .map(|camera| camera.id().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Camera>> {
        self.cameras.values()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

/// Outbound H.264 track shared by every viewer of one camera.
pub(crate) fn live_track() -> TrackLocalStaticSample {
    TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            ..Default::default()
        },
        "v".to_owned(),
        "v".to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AccessList;
    use url::Url;

    fn settings(id: &str, acl: &[&str]) -> CameraSettings {
        CameraSettings {
            id: id.to_string(),
            url: Url::parse("rtsp://10.0.0.2/s").unwrap(),
            record: false,
            threshold: 0.0,
            acl: AccessList::new(acl.iter().map(|p| p.parse().unwrap()).collect()),
        }
    }

    fn registry() -> Registry {
        Registry::new(
            vec![settings("yard", &[]), settings("front", &["10.0.0.0/24"])],
            &CancellationToken::new(),
        )
    }

    #[test]
    fn unknown_and_denied_look_the_same() {
        let reg = registry();
        let outside: IpAddr = "10.0.1.5".parse().unwrap();
        let unknown = reg.resolve("garage", outside).err().unwrap();
        let denied = reg.resolve("front", outside).err().unwrap();
        assert_eq!(unknown.class(), denied.class());
        assert!(matches!(denied, NvrError::CameraNotFound(_)));
    }

    #[test]
    fn allowed_address_resolves() {
        let reg = registry();
        let cam = reg.resolve("front", "10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(cam.id(), "front");
    }

    #[test]
    fn visible_ids_filtered_and_sorted() {
        let reg = registry();
        assert_eq!(
            reg.visible_ids("10.0.0.5".parse().unwrap()),
            ["front", "yard"]
        );
        assert_eq!(reg.visible_ids("192.168.1.1".parse().unwrap()), ["yard"]);
    }

    #[test]
    fn every_camera_owns_a_track() {
        let reg = registry();
        let front = reg.get("front").unwrap();
        let yard = reg.get("yard").unwrap();
        assert!(!Arc::ptr_eq(front.track(), yard.track()));
    }

    #[test]
    fn camera_tokens_follow_root() {
        let root = CancellationToken::new();
        let reg = Registry::new(vec![settings("yard", &[])], &root);
        let yard = reg.get("yard").unwrap();
        assert!(!yard.cancel_token().is_cancelled());
        root.cancel();
        assert!(yard.cancel_token().is_cancelled());
    }
}
