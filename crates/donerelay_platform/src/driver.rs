#![forbid(unsafe_code)]

use std::sync::Arc;

use donerelay_domain::{Platform, RelaySettings};

use crate::api::{ChzzkApi, CredentialSource, SoopApi};
use crate::codec::{ChzzkCodec, FrameCodec, SoopCodec};
use crate::transport::WsConnector;

/// Everything platform-specific a session needs.
#[derive(Clone)]
pub struct PlatformDriver {
	pub codec: Arc<dyn FrameCodec>,
	pub credentials: Arc<dyn CredentialSource>,
	pub connector: WsConnector,
}

impl PlatformDriver {
	pub fn platform(&self) -> Platform {
		self.codec.platform()
	}
}

/// Builds a driver per new session, so toggles from the current snapshot apply.
pub trait DriverFactory: Send + Sync + 'static {
	fn driver(&self, platform: Platform, settings: &RelaySettings) -> PlatformDriver;
}

/// Real HTTP lookups and websockets.
pub struct LiveDrivers {
	chzzk: Arc<ChzzkApi>,
	soop: Arc<SoopApi>,
	connector: WsConnector,
}

impl LiveDrivers {
	pub fn new(chzzk: ChzzkApi, soop: SoopApi, connector: WsConnector) -> Self {
		Self {
			chzzk: Arc::new(chzzk),
			soop: Arc::new(soop),
			connector,
		}
	}
}

impl DriverFactory for LiveDrivers {
	fn driver(&self, platform: Platform, settings: &RelaySettings) -> PlatformDriver {
		let (codec, credentials): (Arc<dyn FrameCodec>, Arc<dyn CredentialSource>) = match platform {
			Platform::Chzzk => (Arc::new(ChzzkCodec), self.chzzk.clone()),
			Platform::Soop => (Arc::new(SoopCodec::new(settings.soop_balloon_amounts)), self.soop.clone()),
		};
		PlatformDriver {
			codec,
			credentials,
			connector: self.connector.clone(),
		}
	}
}
