//! File datapoints: create, upload and close, plus the download path for
//! file properties sent to the device.

use super::{Command, FileLocation, InitOutcome, OpCmd, OpContext, OpEvent, StepOutcome};
use crate::app::{OP_FILE_DP_CREATE, OP_FILE_DP_FETCHED, OP_FILE_DP_REQ, OP_FILE_DP_SEND};
use crate::error::ErrType;
use crate::http::{HttpMethod, HttpResponse};
use crate::link::CloudLink;
use serde_json::{json, Value};
use std::path::PathBuf;

/// Converts a datapoint location `<prop>/<dp>` into its datapoint URL.
/// Locations without a `/` cannot be addressed.
pub fn location_url(link: &CloudLink, location: &str) -> Option<String> {
    let (prop, dp) = location.rsplit_once('/')?;
    Some(link.device_url(&format!("properties{prop}/datapoints/{dp}")))
}

fn datapoint(resp: &HttpResponse) -> Option<Value> {
    resp.json()?.get("datapoint").cloned()
}

/// `POST` a new file datapoint. The cloud returns where the datapoint lives
/// and where its content goes; both are remembered for the upload.
pub struct FileDpCreate {
    name: String,
    prop_info: Value,
}

impl FileDpCreate {
    pub fn new(name: impl Into<String>, prop_info: Value) -> Self {
        Self { name: name.into(), prop_info }
    }
}

impl Command for FileDpCreate {
    fn name(&self) -> &'static str {
        OP_FILE_DP_CREATE
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let url = ctx.link.device_url(&format!("properties/{}/datapoints.json", self.name));
        InitOutcome::Send(
            ctx.link
                .request(HttpMethod::Post, url)
                .json(json!({"datapoint": self.prop_info})),
        )
    }

    fn on_success(&mut self, cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(dp) = datapoint(resp) else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        let (Some(location), Some(file)) = (
            dp.get("location").and_then(Value::as_str),
            dp.get("file").and_then(Value::as_str),
        ) else {
            log::warn!("ops: file datapoint response without location");
            return StepOutcome::Failed(ErrType::Unknown);
        };
        *ctx.file = Some(FileLocation { location: location.to_string(), file: file.to_string() });
        ctx.app.file_dp_location(cmd.req_id, &self.name, location);
        StepOutcome::Done
    }
}

/// Uploads the local file to the content URL of the last created datapoint,
/// then closes the datapoint.
pub struct FileDpSend {
    location: String,
    path: PathBuf,
}

impl FileDpSend {
    pub fn new(location: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { location: location.into(), path: path.into() }
    }
}

impl Command for FileDpSend {
    fn name(&self) -> &'static str {
        OP_FILE_DP_SEND
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let Some(current) = ctx.file.as_ref().filter(|file| file.location == self.location) else {
            log::debug!("ops: unknown file location {}", self.location);
            return InitOutcome::Fail(ErrType::InvalidArgs);
        };
        InitOutcome::Send(
            ctx.link
                .request(HttpMethod::Put, current.file.clone())
                .file(self.path.clone())
                .external(),
        )
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, _ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
        StepOutcome::Next(Box::new(FileDpClose))
    }
}

/// Marks the upload of the last created datapoint complete.
pub struct FileDpClose;

impl Command for FileDpClose {
    fn name(&self) -> &'static str {
        OP_FILE_DP_SEND
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        let url = ctx
            .file
            .as_ref()
            .and_then(|file| location_url(ctx.link, &file.location));
        match url {
            Some(url) => InitOutcome::Send(ctx.link.request(HttpMethod::Put, url)),
            None => InitOutcome::Fail(ErrType::Unknown),
        }
    }
}

/// Tells the cloud a downloaded file datapoint has been consumed.
pub struct FileDpFetched {
    location: String,
}

impl FileDpFetched {
    pub fn new(location: impl Into<String>) -> Self {
        Self { location: location.into() }
    }
}

impl Command for FileDpFetched {
    fn name(&self) -> &'static str {
        OP_FILE_DP_FETCHED
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        match location_url(ctx.link, &self.location) {
            Some(url) => InitOutcome::Send(
                ctx.link
                    .request(HttpMethod::Put, url)
                    .json(json!({"datapoint": {"fetched": true}})),
            ),
            None => InitOutcome::Fail(ErrType::InvalidArgs),
        }
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>, _resp: &HttpResponse) -> StepOutcome {
        ctx.events.push(OpEvent::FileFetched);
        StepOutcome::Done
    }
}

/// Looks up a file datapoint and downloads its content to `path`.
pub struct FileDpRequest {
    location: String,
    path: PathBuf,
}

impl FileDpRequest {
    pub fn new(location: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { location: location.into(), path: path.into() }
    }
}

impl Command for FileDpRequest {
    fn name(&self) -> &'static str {
        OP_FILE_DP_REQ
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        match location_url(ctx.link, &self.location) {
            Some(url) => InitOutcome::Send(ctx.link.request(HttpMethod::Get, url)),
            None => InitOutcome::Fail(ErrType::InvalidArgs),
        }
    }

    fn on_success(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>, resp: &HttpResponse) -> StepOutcome {
        let Some(file) = datapoint(resp)
            .and_then(|dp| dp.get("file").and_then(Value::as_str).map(str::to_string))
        else {
            return StepOutcome::Failed(ErrType::Unknown);
        };
        let location = ctx.file.take().map(|current| current.location).unwrap_or_default();
        *ctx.file = Some(FileLocation { location, file: file.clone() });
        StepOutcome::Next(Box::new(FileDownload { url: file, path: self.path.clone() }))
    }
}

struct FileDownload {
    url: String,
    path: PathBuf,
}

impl Command for FileDownload {
    fn name(&self) -> &'static str {
        OP_FILE_DP_REQ
    }

    fn init(&mut self, _cmd: &mut OpCmd, ctx: &mut OpContext<'_>) -> InitOutcome {
        InitOutcome::Send(
            ctx.link
                .request(HttpMethod::Get, self.url.clone())
                .save_to(self.path.clone())
                .external(),
        )
    }
}
