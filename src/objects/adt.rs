//! Generic ADT implementation of [`ObjectOperations`].
//!
//! Maps each [`ObjectKind`] to its repository collection and issues the
//! standard lifecycle calls. Payloads are passed through as given; building
//! kind-specific object descriptions is left to the caller.

use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::{BoxFuture, Connection, HttpMethod, RemoteResponse, RequestSpec};
use crate::models::lock::ObjectKind;
use crate::{AppError, Result};

use super::{CheckVersion, ObjectOperations, ObjectRef, Outcome};

const LOCK_ACCEPT: &str = "application/vnd.sap.as+xml;charset=UTF-8;dataname=com.sap.adt.lock.result;q=0.8, \
     application/vnd.sap.as+xml;charset=UTF-8;dataname=com.sap.adt.lock.result2;q=0.9";
const CHECKRUN_CONTENT_TYPE: &str = "application/vnd.sap.adt.checkobjects+xml";
const SOURCE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const OBJECT_CONTENT_TYPE: &str = "application/*";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ADT-backed operations for every supported object kind.
pub struct AdtObjectOps {
    lock_handle: Regex,
    short_text: Regex,
}

impl AdtObjectOps {
    /// Build the operations, compiling the response extractors.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an extractor pattern fails to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            lock_handle: compile(r"<LOCK_HANDLE>([^<]+)</LOCK_HANDLE>")?,
            short_text: compile(r"<SHORT_TEXT>([^<]*)</SHORT_TEXT>")?,
        })
    }

    /// Extract the lock handle from a lock response body.
    #[must_use]
    pub fn extract_lock_handle(&self, body: &str) -> Option<String> {
        self.lock_handle
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_owned())
            .filter(|handle| !handle.is_empty())
    }

    fn validation_outcome(&self, response: RemoteResponse) -> Outcome {
        if response.data.contains("<SEVERITY>ERROR</SEVERITY>") {
            let reason = self
                .short_text
                .captures(&response.data)
                .and_then(|caps| caps.get(1))
                .map_or_else(|| "validation failed".to_owned(), |m| m.as_str().to_owned());
            Outcome::Alternate { reason, response }
        } else {
            Outcome::Ok(response)
        }
    }
}

impl ObjectOperations for AdtObjectOps {
    fn validate<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let mut request = RequestSpec::new(
                HttpMethod::Post,
                format!("{}/validation", collection_path(object)?),
            )
            .query("objname", object.name.as_str());
            if let Some(package) = &object.package {
                request = request.query("packagename", package.as_str());
            }
            if let Some(description) = &object.description {
                request = request.query("description", description.as_str());
            }

            match conn.make_request(request).await {
                Ok(response) => Ok(self.validation_outcome(response)),
                Err(AppError::RemoteRejected { status: 400, body })
                    if body.to_ascii_lowercase().contains("already exist") =>
                {
                    Ok(Outcome::Alternate {
                        reason: "object already exists".into(),
                        response: RemoteResponse {
                            status: 400,
                            data: body,
                            ..RemoteResponse::default()
                        },
                    })
                }
                Err(err) => Err(err),
            }
        })
    }

    fn create<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        payload: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let payload = payload.ok_or_else(|| {
                AppError::Config(format!("creating {object} requires an object description payload"))
            })?;
            let request = RequestSpec::new(HttpMethod::Post, collection_path(object)?)
                .body(OBJECT_CONTENT_TYPE, payload);
            conn.make_request(request).await
        })
    }

    fn check_syntax<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        version: CheckVersion,
        payload: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let body = checkrun_body(&object_path(object)?, &source_path(object)?, version, payload);
            let request = RequestSpec::new(HttpMethod::Post, "/sap/bc/adt/checkruns")
                .query("reporters", "abapCheckRun")
                .body(CHECKRUN_CONTENT_TYPE, body);
            let response = conn.make_request(request).await?;
            if response.data.contains(r#"chkrun:type="E""#) {
                return Err(AppError::RemoteRejected {
                    status: response.status,
                    body: response.data,
                });
            }
            Ok(response)
        })
    }

    fn acquire_lock<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let request = RequestSpec::new(HttpMethod::Post, object_path(object)?)
                .query("_action", "LOCK")
                .query("accessMode", "MODIFY")
                .header("Accept", LOCK_ACCEPT);
            let response = conn.make_request(request).await?;
            self.extract_lock_handle(&response.data)
                .ok_or(AppError::RemoteRejected {
                    status: response.status,
                    body: format!("lock response carried no LOCK_HANDLE: {}", response.data),
                })
        })
    }

    fn update<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        lock_handle: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let request = RequestSpec::new(HttpMethod::Put, source_path(object)?)
                .query("lockHandle", lock_handle)
                .body(SOURCE_CONTENT_TYPE, payload);
            conn.make_request(request).await
        })
    }

    fn unlock<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        lock_handle: &'a str,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let request = RequestSpec::new(HttpMethod::Post, object_path(object)?)
                .query("_action", "UNLOCK")
                .query("lockHandle", lock_handle);
            conn.make_request(request).await
        })
    }

    fn activate<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let body = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<adtcore:objectReferences xmlns:adtcore="http://www.sap.com/adt/core">
  <adtcore:objectReference adtcore:uri="{}" adtcore:name="{}"/>
</adtcore:objectReferences>"#,
                escape_xml(&object_path(object)?),
                escape_xml(&object.name),
            );
            let request = RequestSpec::new(HttpMethod::Post, "/sap/bc/adt/activation")
                .query("method", "activate")
                .query("preauditRequested", "true")
                .body("application/xml", body);
            let response = conn.make_request(request).await?;
            if response.data.contains(r#"type="E""#) {
                return Err(AppError::RemoteRejected {
                    status: response.status,
                    body: response.data,
                });
            }
            Ok(response)
        })
    }

    fn delete<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        lock_handle: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let body = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<del:deletionRequest xmlns:del="http://www.sap.com/adt/deletion" xmlns:adtcore="http://www.sap.com/adt/core">
  <del:object adtcore:uri="{}"/>
</del:deletionRequest>"#,
                escape_xml(&object_path(object)?),
            );
            let mut request = RequestSpec::new(HttpMethod::Post, "/sap/bc/adt/deletion/delete")
                .body("application/xml", body);
            if let Some(handle) = lock_handle {
                request = request.query("lockHandle", handle);
            }
            conn.make_request(request).await
        })
    }

    fn read<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        wait_for_consistency: Option<Duration>,
    ) -> BoxFuture<'a, RemoteResponse> {
        Box::pin(async move {
            let request = RequestSpec::new(HttpMethod::Get, source_path(object)?);
            let Some(budget) = wait_for_consistency else {
                return conn.make_request(request).await;
            };

            let deadline = Instant::now() + budget;
            loop {
                let last_error = match conn.make_request(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(AppError::RemoteRejected { status: 404, body }) => {
                        AppError::RemoteRejected { status: 404, body }
                    }
                    Err(AppError::Network(msg)) => AppError::Network(msg),
                    Err(err) => return Err(err),
                };
                if Instant::now() + POLL_INTERVAL > deadline {
                    debug!(object = %object, %last_error, "consistency read budget exhausted");
                    return Err(AppError::Network(format!(
                        "{object} not visible after {}s: {last_error}",
                        budget.as_secs()
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| AppError::Config(format!("invalid pattern {pattern}: {err}")))
}

/// Repository collection an object is created in.
fn collection_path(object: &ObjectRef) -> Result<String> {
    let path = match object.kind {
        ObjectKind::Class => "/sap/bc/adt/oo/classes",
        ObjectKind::Interface => "/sap/bc/adt/oo/interfaces",
        ObjectKind::Program => "/sap/bc/adt/programs/programs",
        ObjectKind::Include => "/sap/bc/adt/programs/includes",
        ObjectKind::FunctionGroup => "/sap/bc/adt/functions/groups",
        ObjectKind::FunctionModule => {
            let group = object.sub_key.as_deref().ok_or_else(|| {
                AppError::Config(format!("{} requires its function group as sub key", object.name))
            })?;
            return Ok(format!(
                "/sap/bc/adt/functions/groups/{}/fmodules",
                encode_segment(group)
            ));
        }
        ObjectKind::Table => "/sap/bc/adt/ddic/tables",
        ObjectKind::Structure => "/sap/bc/adt/ddic/structures",
        ObjectKind::DataElement => "/sap/bc/adt/ddic/dataelements",
        ObjectKind::Domain => "/sap/bc/adt/ddic/domains",
        ObjectKind::Package => "/sap/bc/adt/packages",
        ObjectKind::View => "/sap/bc/adt/ddic/ddl/sources",
        ObjectKind::Behavior => "/sap/bc/adt/bo/behaviordefinitions",
        ObjectKind::ServiceDefinition => "/sap/bc/adt/ddic/srvd/sources",
        ObjectKind::MetadataExtension => "/sap/bc/adt/ddic/ddlx/sources",
    };
    Ok(path.to_owned())
}

/// URI of the object itself (lock, unlock, activation, deletion).
pub(crate) fn object_path(object: &ObjectRef) -> Result<String> {
    Ok(format!(
        "{}/{}",
        collection_path(object)?,
        encode_segment(&object.name)
    ))
}

/// URI the source payload is written to.
pub(crate) fn source_path(object: &ObjectRef) -> Result<String> {
    let base = object_path(object)?;
    let has_source = !matches!(
        object.kind,
        ObjectKind::DataElement | ObjectKind::Domain | ObjectKind::Package | ObjectKind::FunctionGroup
    );
    Ok(if has_source {
        format!("{base}/source/main")
    } else {
        base
    })
}

/// Lower-case a name and escape namespace slashes (`/NS/NAME`).
fn encode_segment(name: &str) -> String {
    name.to_lowercase().replace('/', "%2f")
}

fn checkrun_body(
    object_uri: &str,
    source_uri: &str,
    version: CheckVersion,
    payload: Option<&str>,
) -> String {
    let artifacts = payload.map_or_else(String::new, |source| {
        format!(
            r#"
    <chkrun:artifacts>
      <chkrun:artifact chkrun:contentType="{SOURCE_CONTENT_TYPE}" chkrun:uri="{}">
        <chkrun:content>{}</chkrun:content>
      </chkrun:artifact>
    </chkrun:artifacts>"#,
            escape_xml(source_uri),
            escape_xml(source),
        )
    });
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<chkrun:checkObjectList xmlns:chkrun="http://www.sap.com/adt/checkrun" xmlns:adtcore="http://www.sap.com/adt/core">
  <chkrun:checkObject adtcore:uri="{}" chkrun:version="{}">{artifacts}
  </chkrun:checkObject>
</chkrun:checkObjectList>"#,
        escape_xml(object_uri),
        version.as_str(),
    )
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
