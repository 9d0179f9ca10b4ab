use super::{Command, InitOutcome, OpCmd, OpContext, OpEvent, StepOutcome};
use crate::dests::DestMask;
use crate::error::ErrType;
use crate::http::{HttpMethod, HttpResponse};
use serde::Deserialize;
use serde_json::Value;

/// Resolves the ephemeral URL the cloud handed out for a pending OTA.
pub struct OtaUrlFetch {
    url: String,
}

impl OtaUrlFetch {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The queued command metadata: daemon-internal, cloud only.
    pub fn cmd() -> OpCmd {
        OpCmd::local(DestMask::ADS)
    }
}

impl Command for OtaUrlFetch {
    fn name(&self) -> &'static str {
        "ota_url_fetch"
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        if self.url.is_empty() {
            log::warn!("ops: missing OTA info URL");
            return InitOutcome::Fail(ErrType::InvalidArgs);
        }
        InitOutcome::Send(ctx.link.request(HttpMethod::Get, self.url.clone()))
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(ota) = resp.json().and_then(|body| body.get("ota").cloned()) else {
            log::warn!("ops: no ota object");
            return StepOutcome::Failed(ErrType::Unknown);
        };
        ctx.events.push(OpEvent::OtaReady(ota));
        StepOutcome::Done
    }
}

/// Host image details carried in an `ota` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OtaImage {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub ver: String,
    #[serde(default)]
    pub size: u64,
}

impl OtaImage {
    pub const HOST_MCU: &'static str = "host_mcu";

    /// Parses an `ota` object. Only host images are accepted.
    pub fn from_value(ota: &Value) -> Option<Self> {
        let image: Self = serde_json::from_value(ota.clone()).ok()?;
        if image.kind != Self::HOST_MCU || image.url.is_empty() {
            return None;
        }
        Some(image)
    }
}
