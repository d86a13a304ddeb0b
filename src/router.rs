//! Public HTTP surface: name-based redirects to supervised apps.
//!
//! The first path segment selects an app. A routable app gets a 302 to its
//! assigned port on the hostname the client used, with the remaining path
//! and query carried over verbatim. A crashed app answers 502 with its
//! captured output, an unknown name bounces back to `/`, and the root path
//! serves a small overview page.

use rocket::http::{ContentType, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{Redirect, Responder, Response};
use rocket::{get, routes, Build, Rocket, State};
use std::io::Cursor;
use std::path::PathBuf;

use crate::config::Config;
use crate::daemon::SharedState;
use crate::registry::AppStatus;

/// Hostname the client addressed, taken from the Host header. Redirects
/// reuse it so `localhost` stays `localhost` and `127.0.0.1` stays numeric.
pub struct RequestHost(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestHost {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        // Raw header, with any `:port` split off
        let host = req.headers().get_one("Host").map(|raw| match raw.split_once(':') {
            Some((name, _)) => name.to_string(),
            None => raw.to_string(),
        });
        Outcome::Success(RequestHost(host))
    }
}

/// Raw origin URI (path plus query) exactly as the client sent it.
pub struct OriginalUri(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for OriginalUri {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(OriginalUri(req.uri().to_string()))
    }
}

pub enum RouteOutcome {
    Redirect(Redirect),
    BadGateway(String),
}

impl<'r> Responder<'r, 'static> for RouteOutcome {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'static> {
        match self {
            RouteOutcome::Redirect(redirect) => redirect.respond_to(req),
            RouteOutcome::BadGateway(body) => Response::build()
                .status(Status::BadGateway)
                .header(ContentType::Plain)
                .sized_body(body.len(), Cursor::new(body))
                .ok(),
        }
    }
}

/// Split an origin URI into the app name and everything after it. The name
/// is matched byte for byte, no case folding or decoding.
fn split_target(uri: &str) -> (&str, &str) {
    let trimmed = uri.strip_prefix('/').unwrap_or(uri);
    match trimmed.find(|c| c == '/' || c == '?') {
        Some(end) => (&trimmed[..end], &trimmed[end..]),
        None => (trimmed, ""),
    }
}

#[get("/")]
fn overview(state: &State<SharedState>) -> (ContentType, String) {
    let state = state.lock().unwrap();
    let mut rows = String::new();

    for entry in state.registry.list() {
        let status = match entry.status {
            AppStatus::Running => "running",
            AppStatus::Starting => "starting",
            AppStatus::Crashed => "crashed",
            AppStatus::Stopped => "stopped",
        };
        rows.push_str(&format!(
            "<li><a href=\"/{name}\">{name}</a> &mdash; {status}</li>\n",
            name = entry.name
        ));
    }

    if rows.is_empty() {
        rows.push_str("<li>no apps registered</li>\n");
    }

    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>portman</title></head>\n\
         <body>\n<h1>portman</h1>\n<ul>\n{rows}</ul>\n</body>\n</html>\n"
    );

    (ContentType::HTML, body)
}

#[get("/<_path..>", rank = 2)]
fn route_app(
    _path: PathBuf,
    uri: OriginalUri,
    host: RequestHost,
    state: &State<SharedState>,
) -> RouteOutcome {
    let (name, rest) = split_target(&uri.0);

    // Snapshot the entry under the lock, never block the daemon on I/O here
    let target = {
        let state = state.lock().unwrap();
        state
            .registry
            .find(name)
            .map(|entry| (entry.status, entry.port, entry.command.clone(), entry.last_error.clone()))
    };

    match target {
        Some((AppStatus::Running | AppStatus::Starting, Some(port), _, _)) => {
            let hostname = host.0.unwrap_or_else(|| "127.0.0.1".to_string());
            // A bare or query-only target still lands on the app's root path
            let rest = match rest {
                "" => "/".to_string(),
                rest if rest.starts_with('?') => format!("/{rest}"),
                rest => rest.to_string(),
            };
            RouteOutcome::Redirect(Redirect::found(format!("http://{hostname}:{port}{rest}")))
        }
        Some((AppStatus::Crashed, _, command, last_error)) => {
            let output = last_error.unwrap_or_default();
            RouteOutcome::BadGateway(format!("{name} failed\n\ncommand: {command}\n\n{output}"))
        }
        // Stopped, port-less, or never registered: back to the overview
        _ => RouteOutcome::Redirect(Redirect::found("/".to_string())),
    }
}

pub fn build(state: SharedState, config: &Config) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", config.daemon.address.clone()))
        .merge(("port", config.daemon.port))
        .merge(("log_level", "off"))
        .merge(("cli_colors", false));

    rocket::custom(figment)
        .manage(state)
        .mount("/", routes![overview, route_app])
}
