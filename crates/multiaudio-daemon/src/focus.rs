// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio-focus ducking fallback.
//!
//! When the system settings cannot be changed, we ask the audio subsystem for
//! transient focus that other streams may duck, so our playback shares the
//! output instead of fighting for it. Platforms expose focus requests in two
//! shapes: a structured request object, or (older) a flat parameter list.
//! One [`FocusRequester`] implementation exists per shape and the right one
//! is picked once, from the platform version.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// First platform API level that accepts structured focus requests.
pub const STRUCTURED_FOCUS_MIN_API: u32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioUsage {
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Music,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioAttributes {
    pub usage: AudioUsage,
    pub content_type: ContentType,
}

/// Legacy stream type used by flat requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Music,
}

impl From<AudioAttributes> for StreamType {
    fn from(attributes: AudioAttributes) -> Self {
        match (attributes.usage, attributes.content_type) {
            (AudioUsage::Media, ContentType::Music) => StreamType::Music,
        }
    }
}

/// Focus mode of a request. Multi-audio only needs transient focus that
/// lets other streams keep playing ducked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusGain {
    GainTransientMayDuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Gain,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusRequestResult {
    Granted,
    Failed,
}

/// Observer for focus changes.
pub type FocusListener = Arc<dyn Fn(FocusChange) + Send + Sync>;

/// Structured focus request.
#[derive(Clone)]
pub struct FocusRequest {
    pub gain: FocusGain,
    pub attributes: AudioAttributes,
    pub will_pause_when_ducked: bool,
    pub listener: FocusListener,
}

impl fmt::Debug for FocusRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusRequest")
            .field("gain", &self.gain)
            .field("attributes", &self.attributes)
            .field("will_pause_when_ducked", &self.will_pause_when_ducked)
            .finish_non_exhaustive()
    }
}

/// Raw focus API of the host audio subsystem, in both of its shapes.
pub trait AudioFocusPlatform: Send + Sync {
    fn api_level(&self) -> u32;

    fn request_focus(&self, request: &FocusRequest) -> FocusRequestResult;

    fn request_focus_flat(
        &self,
        listener: FocusListener,
        stream: StreamType,
        gain: FocusGain,
    ) -> FocusRequestResult;

    /// Give back whatever focus is held. No-op when none is.
    fn abandon_focus(&self);
}

/// One way of asking for ducking focus.
pub trait FocusRequester: Send + Sync {
    fn request(&self, attributes: AudioAttributes, listener: FocusListener) -> FocusRequestResult;

    fn abandon(&self);

    fn shape(&self) -> &'static str;
}

/// Builds a [`FocusRequest`] object.
pub struct StructuredFocusRequester {
    platform: Arc<dyn AudioFocusPlatform>,
}

impl FocusRequester for StructuredFocusRequester {
    fn request(&self, attributes: AudioAttributes, listener: FocusListener) -> FocusRequestResult {
        let request = FocusRequest {
            gain: FocusGain::GainTransientMayDuck,
            attributes,
            will_pause_when_ducked: false,
            listener,
        };
        debug!("Structured focus request: {:?}", request);
        self.platform.request_focus(&request)
    }

    fn abandon(&self) {
        self.platform.abandon_focus();
    }

    fn shape(&self) -> &'static str {
        "structured"
    }
}

/// Passes listener, stream type and gain mode directly.
pub struct FlatFocusRequester {
    platform: Arc<dyn AudioFocusPlatform>,
}

impl FocusRequester for FlatFocusRequester {
    fn request(&self, attributes: AudioAttributes, listener: FocusListener) -> FocusRequestResult {
        let stream = StreamType::from(attributes);
        debug!("Flat focus request: {:?}, may duck", stream);
        self.platform
            .request_focus_flat(listener, stream, FocusGain::GainTransientMayDuck)
    }

    fn abandon(&self) {
        self.platform.abandon_focus();
    }

    fn shape(&self) -> &'static str {
        "flat"
    }
}

/// Pick the requester matching the platform version.
pub fn select_requester(platform: Arc<dyn AudioFocusPlatform>) -> Box<dyn FocusRequester> {
    let level = platform.api_level();
    if level >= STRUCTURED_FOCUS_MIN_API {
        Box::new(StructuredFocusRequester { platform })
    } else {
        Box::new(FlatFocusRequester { platform })
    }
}

/// Last-resort strategy: accept sharing the output instead of forcing it.
pub struct AudioFocusFallback {
    requester: Box<dyn FocusRequester>,
}

impl AudioFocusFallback {
    pub fn new(platform: Arc<dyn AudioFocusPlatform>) -> Self {
        Self {
            requester: select_requester(platform),
        }
    }

    pub fn shape(&self) -> &'static str {
        self.requester.shape()
    }

    /// Request transient, duckable media focus. True iff granted.
    pub fn request_ducking(&self) -> bool {
        let attributes = AudioAttributes {
            usage: AudioUsage::Media,
            content_type: ContentType::Music,
        };
        let listener: FocusListener = Arc::new(log_focus_change);

        match self.requester.request(attributes, listener) {
            FocusRequestResult::Granted => {
                info!("Audio focus granted");
                true
            }
            FocusRequestResult::Failed => {
                warn!("Audio focus request failed");
                false
            }
        }
    }

    pub fn abandon(&self) {
        self.requester.abandon();
    }
}

fn log_focus_change(change: FocusChange) {
    match change {
        FocusChange::Gain => debug!("Audio focus gained"),
        FocusChange::Loss => debug!("Audio focus lost"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Structured(FocusGain, AudioAttributes, bool),
        Flat(StreamType, FocusGain),
        Abandon,
    }

    pub(crate) struct FakePlatform {
        level: u32,
        result: FocusRequestResult,
        pub(crate) calls: Mutex<Vec<Call>>,
        pub(crate) requests: AtomicUsize,
    }

    impl FakePlatform {
        pub(crate) fn new(level: u32, result: FocusRequestResult) -> Arc<Self> {
            Arc::new(Self {
                level,
                result,
                calls: Mutex::new(Vec::new()),
                requests: AtomicUsize::new(0),
            })
        }
    }

    impl AudioFocusPlatform for FakePlatform {
        fn api_level(&self) -> u32 {
            self.level
        }

        fn request_focus(&self, request: &FocusRequest) -> FocusRequestResult {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(Call::Structured(
                request.gain,
                request.attributes,
                request.will_pause_when_ducked,
            ));
            (request.listener)(FocusChange::Gain);
            self.result
        }

        fn request_focus_flat(
            &self,
            listener: FocusListener,
            stream: StreamType,
            gain: FocusGain,
        ) -> FocusRequestResult {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(Call::Flat(stream, gain));
            listener(FocusChange::Gain);
            self.result
        }

        fn abandon_focus(&self) {
            self.calls.lock().push(Call::Abandon);
        }
    }

    #[test]
    fn test_new_platform_uses_structured_request() {
        let platform = FakePlatform::new(STRUCTURED_FOCUS_MIN_API, FocusRequestResult::Granted);
        let fallback = AudioFocusFallback::new(platform.clone());
        assert_eq!(fallback.shape(), "structured");
        assert!(fallback.request_ducking());
        assert_eq!(
            platform.calls.lock().clone(),
            vec![Call::Structured(
                FocusGain::GainTransientMayDuck,
                AudioAttributes {
                    usage: AudioUsage::Media,
                    content_type: ContentType::Music,
                },
                false,
            )]
        );
    }

    #[test]
    fn test_old_platform_uses_flat_request() {
        let platform = FakePlatform::new(STRUCTURED_FOCUS_MIN_API - 1, FocusRequestResult::Granted);
        let fallback = AudioFocusFallback::new(platform.clone());
        assert_eq!(fallback.shape(), "flat");
        assert!(fallback.request_ducking());
        assert_eq!(
            platform.calls.lock().clone(),
            vec![Call::Flat(StreamType::Music, FocusGain::GainTransientMayDuck)]
        );
    }

    #[test]
    fn test_failed_request_is_not_ducking() {
        let platform = FakePlatform::new(20, FocusRequestResult::Failed);
        let fallback = AudioFocusFallback::new(platform.clone());
        assert!(!fallback.request_ducking());
        assert_eq!(platform.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandon_reaches_platform() {
        let platform = FakePlatform::new(5, FocusRequestResult::Granted);
        let fallback = AudioFocusFallback::new(platform.clone());
        fallback.abandon();
        assert_eq!(platform.calls.lock().clone(), vec![Call::Abandon]);
    }
}
