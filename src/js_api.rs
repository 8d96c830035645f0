//! Globals exposed to extension scripts: `file`, `http` and `console`.
//!
//! Every `file.*` and `http.*` call returns a plain object of the shape
//! `{ success, error?, code?, ... }` instead of throwing, so a script can
//! branch on failures. Async work is driven to completion on the calling
//! script thread through the captured runtime handle.

use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::error::Error;
use crate::file_bridge::FileBridge;
use crate::script::{js_to_json, json_to_js};

fn failure(err: &Error) -> serde_json::Value {
    json!({ "success": false, "error": err.to_string(), "code": err.code() })
}

fn respond<'js>(ctx: &Ctx<'js>, result: Result<serde_json::Value, Error>) -> rquickjs::Result<Value<'js>> {
    let payload = match result {
        Ok(mut ok) => {
            if let Some(map) = ok.as_object_mut() {
                map.insert("success".into(), json!(true));
            }
            ok
        }
        Err(err) => failure(&err),
    };
    json_to_js(ctx, &payload)
}

/// Render any JS value the way `console.log` would.
fn display_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    match js_to_json(ctx, value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "<unprintable>".to_string(),
    }
}

/// Pull `headers` (string map) and `onProgress` (function) out of an options object.
fn parse_options<'js>(
    ctx: &Ctx<'js>,
    options: Option<Value<'js>>,
) -> rquickjs::Result<(HashMap<String, String>, Option<Function<'js>>)> {
    let mut headers = HashMap::new();
    let Some(obj) = options.as_ref().and_then(|v| v.as_object()) else {
        return Ok((headers, None));
    };

    if let Some(h) = obj.get::<_, Option<Object>>("headers")? {
        for item in h.props::<String, Value>() {
            let (k, v) = item?;
            headers.insert(k, display_value(ctx, v));
        }
    }
    let on_progress = obj
        .get::<_, Value>("onProgress")?
        .into_function();
    Ok((headers, on_progress))
}

/// Install the capability globals for one extension into `ctx`.
pub fn install<'js>(
    ctx: &Ctx<'js>,
    bridge: Arc<FileBridge>,
    handle: Handle,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let extension = bridge.sandbox().extension().to_string();

    globals.set("file", file_object(ctx, &bridge, &handle)?)?;
    globals.set("http", http_object(ctx, &bridge, &handle)?)?;
    globals.set("console", console_object(ctx, &extension)?)?;
    Ok(())
}

fn file_object<'js>(
    ctx: &Ctx<'js>,
    bridge: &Arc<FileBridge>,
    handle: &Handle,
) -> rquickjs::Result<Object<'js>> {
    let file = Object::new(ctx.clone())?;

    let b = Arc::clone(bridge);
    let h = handle.clone();
    file.set(
        "download",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: String, path: String, options: Opt<Value<'js>>| {
                let (headers, on_progress) = parse_options(&ctx, options.0)?;
                let mut report = |written: u64, total: u64| {
                    if let Some(cb) = &on_progress {
                        // A failing progress callback does not abort the transfer
                        let _ = cb.call::<_, ()>((written as f64, total as f64));
                    }
                };
                let progress: Option<&mut dyn FnMut(u64, u64)> = if on_progress.is_some() {
                    Some(&mut report)
                } else {
                    None
                };
                let outcome = h.block_on(b.download(&url, &path, &headers, progress));
                respond(
                    &ctx,
                    outcome
                        .map(|o| json!({ "path": o.path.to_string_lossy(), "size": o.size })),
                )
            },
        )?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "exists",
        Function::new(ctx.clone(), move |path: String| {
            b.exists(&path).unwrap_or(false)
        })?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "read",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String| {
            respond(&ctx, b.read(&path).map(|data| json!({ "data": data })))
        })?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "write",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String, data: String| {
            respond(
                &ctx,
                b.write(&path, &data)
                    .map(|p| json!({ "path": p.to_string_lossy() })),
            )
        })?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "delete",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String| {
            respond(&ctx, b.delete(&path).map(|_| json!({})))
        })?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "copy",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, src: String, dst: String| {
            respond(
                &ctx,
                b.copy(&src, &dst).map(|p| json!({ "path": p.to_string_lossy() })),
            )
        })?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "move",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, src: String, dst: String| {
            respond(
                &ctx,
                b.move_file(&src, &dst)
                    .map(|p| json!({ "path": p.to_string_lossy() })),
            )
        })?,
    )?;

    let b = Arc::clone(bridge);
    file.set(
        "getSize",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String| {
            respond(&ctx, b.size(&path).map(|size| json!({ "size": size })))
        })?,
    )?;

    Ok(file)
}

fn http_object<'js>(
    ctx: &Ctx<'js>,
    bridge: &Arc<FileBridge>,
    handle: &Handle,
) -> rquickjs::Result<Object<'js>> {
    let http = Object::new(ctx.clone())?;

    let b = Arc::clone(bridge);
    let h = handle.clone();
    http.set(
        "get",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: String, options: Opt<Value<'js>>| {
                let (headers, _) = parse_options(&ctx, options.0)?;
                let result = h.block_on(async {
                    b.sandbox().validate_domain(&url)?;
                    let response = b.transport().get(&url, &headers).await?;
                    let status = response.status().as_u16();
                    let response_headers: serde_json::Map<String, serde_json::Value> = response
                        .headers()
                        .iter()
                        .filter_map(|(k, v)| {
                            v.to_str().ok().map(|v| (k.as_str().to_string(), json!(v)))
                        })
                        .collect();
                    let body = response.text().await?;
                    Ok::<_, Error>(json!({
                        "status": status,
                        "body": body,
                        "headers": response_headers,
                    }))
                });
                respond(&ctx, result)
            },
        )?,
    )?;

    Ok(http)
}

fn console_object<'js>(ctx: &Ctx<'js>, extension: &str) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;

    for (name, level) in [
        ("log", crate::logging::LogLevel::Info),
        ("info", crate::logging::LogLevel::Info),
        ("debug", crate::logging::LogLevel::Debug),
        ("warn", crate::logging::LogLevel::Warn),
        ("error", crate::logging::LogLevel::Error),
    ] {
        let tag = extension.to_string();
        console.set(
            name,
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                let line = args
                    .0
                    .into_iter()
                    .map(|v| display_value(&ctx, v))
                    .collect::<Vec<_>>()
                    .join(" ");
                crate::logging::log(level, &format!("[extension:{}] {}", tag, line));
            })?,
        )?;
    }

    Ok(console)
}
