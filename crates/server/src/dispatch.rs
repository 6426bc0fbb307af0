//! Command dispatch: one framed request in, exactly one reply out.
//!
//! Handlers run on the connection's reader task and may mutate the session.
//! Cheap storage and catalog calls happen inline; upload finalization is
//! snapshotted and handed to the worker pool, which delivers its reply
//! through the same outbox the reader uses.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cumulus_catalog::FileRecord;
use cumulus_protocol::Message;
use cumulus_storage::{normalize_relative, StorageError};

use crate::server::ServerInner;
use crate::session::{Session, UploadSession};

/// Thread-safe handle for queueing replies to one connection.
///
/// Clones travel into worker tasks; a send to a connection that has since
/// closed is silently dropped.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("dropping reply for a closed connection");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] cumulus_catalog::CatalogError),

    #[error(transparent)]
    Auth(#[from] cumulus_auth::AuthError),

    #[error(transparent)]
    Token(#[from] cumulus_auth::TokenError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn reply(cmd: &str, status: &str) -> Message {
    Message::new([("cmd", cmd), ("status", status)])
}

/// Handles one decoded request and queues exactly one response (possibly
/// asynchronously, for commit).
pub fn dispatch(inner: &Arc<ServerInner>, session: &mut Session, request: Message, outbox: &Outbox) {
    let Some(cmd) = request.command().map(str::to_owned) else {
        outbox.send(Message::new([("cmd", "ERROR"), ("status", "MissingCommand")]));
        return;
    };

    match handle_command(inner, session, &cmd, &request, outbox) {
        Ok(Some(response)) => outbox.send(response),
        Ok(None) => {} // the worker pool owns the reply
        Err(HandlerError::Storage(StorageError::PathTraversal { path })) => {
            warn!(peer = %session.peer, path, "rejected path traversal");
            outbox.send(reply(&cmd, "path_traversal"));
        }
        Err(err) => {
            let mut response = reply(&cmd, "error");
            response.set_header("reason", err.to_string());
            outbox.send(response);
        }
    }
}

fn handle_command(
    inner: &Arc<ServerInner>,
    session: &mut Session,
    cmd: &str,
    request: &Message,
    outbox: &Outbox,
) -> Result<Option<Message>, HandlerError> {
    match cmd {
        "REGISTER" => return register(inner, request),
        "LOGIN" => return login(inner, session, request),
        "TOKEN_AUTH" => return token_auth(inner, session, request),
        _ => {}
    }

    // Every other command requires a verified bearer token.
    let Some(token) = request.header("token").filter(|t| !t.is_empty()) else {
        return Ok(Some(reply(cmd, "auth_required")));
    };
    let claims = match inner.tokens.verify(token) {
        Ok(claims) => claims,
        Err(err) => {
            debug!(peer = %session.peer, "token rejected: {err}");
            return Ok(Some(reply(cmd, "token_invalid")));
        }
    };
    session.username = claims.sub;

    match cmd {
        "DIR_PWD" => dir_pwd(session),
        "DIR_CHANGE" => dir_change(inner, session, request),
        "DIR_MKDIR" => dir_mkdir(inner, session, request),
        "DIR_LIST" => dir_list(inner, session, request),
        "FILE_DELETE" => file_delete(inner, session, request),
        "FILE_UPLOAD_INIT" => upload_init(inner, session, request),
        "FILE_UPLOAD_CHUNK" => upload_chunk(inner, session, request),
        "FILE_UPLOAD_COMMIT" => upload_commit(inner, session, outbox),
        "FILE_DOWNLOAD_INIT" => download_init(inner, session, request),
        "FILE_DOWNLOAD_FETCH" => download_fetch(inner, session, request),
        _ => Ok(Some(reply(cmd, "unknown"))),
    }
}

fn required<'a>(request: &'a Message, key: &str) -> Option<&'a str> {
    request.header(key).filter(|value| !value.is_empty())
}

fn register(inner: &ServerInner, request: &Message) -> Result<Option<Message>, HandlerError> {
    let (Some(username), Some(password)) =
        (required(request, "username"), required(request, "password"))
    else {
        return Ok(Some(reply("REGISTER", "invalid")));
    };

    let status = if inner.users.register(username, password)? {
        "ok"
    } else {
        "exists"
    };
    Ok(Some(reply("REGISTER", status)))
}

fn login(
    inner: &ServerInner,
    session: &mut Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let (Some(username), Some(password)) =
        (required(request, "username"), required(request, "password"))
    else {
        return Ok(Some(reply("LOGIN", "invalid")));
    };

    if !inner.users.validate(username, password)? {
        return Ok(Some(reply("LOGIN", "denied")));
    }

    let token = inner.tokens.issue(username)?;
    session.username = username.to_string();
    session.cwd = ".".into();
    info!(username, peer = %session.peer, "user logged in");

    Ok(Some(Message::new([
        ("cmd", "LOGIN"),
        ("status", "ok"),
        ("token", token.as_str()),
        ("home", "."),
    ])))
}

fn token_auth(
    inner: &ServerInner,
    session: &mut Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let Some(token) = required(request, "token") else {
        return Ok(Some(reply("TOKEN_AUTH", "missing")));
    };
    let Ok(claims) = inner.tokens.verify(token) else {
        return Ok(Some(reply("TOKEN_AUTH", "invalid")));
    };
    session.username = claims.sub;
    Ok(Some(reply("TOKEN_AUTH", "ok")))
}

fn dir_pwd(session: &Session) -> Result<Option<Message>, HandlerError> {
    Ok(Some(Message::new([
        ("cmd", "DIR_PWD"),
        ("status", "ok"),
        ("path", session.cwd.display().to_string().as_str()),
    ])))
}

fn dir_change(
    inner: &ServerInner,
    session: &mut Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let Some(path) = required(request, "path") else {
        return Ok(Some(reply("DIR_CHANGE", "invalid")));
    };

    let resolved = inner
        .storage
        .resolve(&session.username, &session.cwd.join(path))?;
    if !resolved.is_dir() {
        return Ok(Some(reply("DIR_CHANGE", "notfound")));
    }

    let user_root = inner
        .storage
        .user_root(&session.username)?
        .canonicalize()?;
    let relative = resolved
        .strip_prefix(&user_root)
        .unwrap_or_else(|_| Path::new("."));
    session.cwd = if relative.as_os_str().is_empty() {
        ".".into()
    } else {
        relative.to_path_buf()
    };

    Ok(Some(Message::new([
        ("cmd", "DIR_CHANGE"),
        ("status", "ok"),
        ("path", session.cwd.display().to_string().as_str()),
    ])))
}

fn dir_mkdir(
    inner: &ServerInner,
    session: &Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let Some(path) = required(request, "path") else {
        return Ok(Some(reply("DIR_MKDIR", "invalid")));
    };

    let created = inner
        .storage
        .ensure_directory(&session.username, &session.cwd.join(path))?;
    Ok(Some(reply("DIR_MKDIR", if created { "ok" } else { "failed" })))
}

fn dir_list(
    inner: &ServerInner,
    session: &Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let target = match request.header("path") {
        Some(path) if !path.is_empty() => session.cwd.join(path),
        _ => session.cwd.clone(),
    };

    let entries = inner.storage.list(&session.username, &target)?;
    let mut body = String::new();
    for entry in &entries {
        body.push_str(&format!(
            "{}|{}|{}|{}\n",
            entry.name,
            if entry.is_directory { "dir" } else { "file" },
            entry.size,
            entry.modified,
        ));
    }

    Ok(Some(Message::with_body(
        [
            ("cmd", "DIR_LIST"),
            ("status", "ok"),
            ("count", entries.len().to_string().as_str()),
        ],
        body.into_bytes(),
    )))
}

fn file_delete(
    inner: &ServerInner,
    session: &Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let Some(path) = required(request, "path") else {
        return Ok(Some(reply("FILE_DELETE", "invalid")));
    };

    let target = session.cwd.join(path);
    if !inner.storage.remove(&session.username, &target)? {
        return Ok(Some(reply("FILE_DELETE", "notfound")));
    }

    // Bytes first, then the catalog row: a stray row only costs a later
    // `notfound`, while the reverse order could orphan bytes.
    let logical = normalize_relative(&target).display().to_string();
    inner.catalog.remove(&session.username, &logical)?;
    Ok(Some(reply("FILE_DELETE", "ok")))
}

fn upload_init(
    inner: &ServerInner,
    session: &mut Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let (Some(path), Some(md5), Some(size)) = (
        required(request, "path"),
        required(request, "md5"),
        required(request, "size"),
    ) else {
        return Ok(Some(reply("FILE_UPLOAD_INIT", "invalid")));
    };
    let Ok(total) = size.parse::<u64>() else {
        return Ok(Some(reply("FILE_UPLOAD_INIT", "invalid")));
    };

    let logical = normalize_relative(&session.cwd.join(path));
    let logical_str = logical.display().to_string();
    let absolute = inner.storage.resolve(&session.username, &logical)?;

    // Instant transfer: the server already holds identical bytes under some
    // other name. A catalog hit whose physical file vanished falls through
    // to a normal upload.
    if let Some(source) = inner.catalog.find_by_md5(md5)? {
        if Path::new(&source.storage_path).exists() {
            inner
                .storage
                .clone_file(Path::new(&source.storage_path), &absolute)?;
            inner.catalog.upsert(&FileRecord {
                owner: session.username.clone(),
                logical_path: logical_str.clone(),
                md5: md5.to_string(),
                storage_path: absolute.display().to_string(),
                size: source.size,
            })?;
            info!(
                username = %session.username,
                path = %logical_str,
                "instant transfer from existing content"
            );
            // A new init aborts any in-flight upload, instant or not.
            session.upload = None;
            return Ok(Some(Message::new([
                ("cmd", "FILE_UPLOAD_INIT"),
                ("status", "instant"),
                ("path", logical_str.as_str()),
            ])));
        }
    }

    let checkpoint = inner
        .storage
        .prepare_upload(&session.username, md5, &logical, total)?;
    let offset = checkpoint.received;

    // A new init replaces any in-flight upload; its on-disk checkpoint
    // stays behind for a future resume.
    session.upload = Some(UploadSession {
        expected_total: checkpoint.total,
        declared_md5: md5.to_string(),
        logical,
        checkpoint,
    });

    Ok(Some(Message::new([
        ("cmd", "FILE_UPLOAD_INIT"),
        ("status", "ready"),
        ("offset", offset.to_string().as_str()),
    ])))
}

fn upload_chunk(
    inner: &ServerInner,
    session: &mut Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let Some(upload) = session.upload.as_mut() else {
        return Ok(Some(reply("FILE_UPLOAD_CHUNK", "no_session")));
    };
    let Some(offset) = required(request, "offset") else {
        return Ok(Some(reply("FILE_UPLOAD_CHUNK", "invalid")));
    };
    let Ok(offset) = offset.parse::<u64>() else {
        return Ok(Some(reply("FILE_UPLOAD_CHUNK", "invalid")));
    };

    if offset != upload.checkpoint.received {
        return Ok(Some(reply("FILE_UPLOAD_CHUNK", "offset")));
    }

    if inner
        .storage
        .write_chunk(&upload.checkpoint, offset, &request.body)
        .is_err()
    {
        return Ok(Some(reply("FILE_UPLOAD_CHUNK", "io_error")));
    }

    upload.checkpoint.received += request.body.len() as u64;
    inner
        .storage
        .update_progress(&upload.checkpoint, upload.checkpoint.received)?;

    Ok(Some(Message::new([
        ("cmd", "FILE_UPLOAD_CHUNK"),
        ("status", "ok"),
        ("received", upload.checkpoint.received.to_string().as_str()),
    ])))
}

fn upload_commit(
    inner: &Arc<ServerInner>,
    session: &mut Session,
    outbox: &Outbox,
) -> Result<Option<Message>, HandlerError> {
    // Deactivate the slot before handing off; the worker operates only on
    // its captured snapshot.
    let Some(upload) = session
        .upload
        .take_if(|u| u.checkpoint.received == u.expected_total)
    else {
        return Ok(Some(reply("FILE_UPLOAD_COMMIT", "incomplete")));
    };
    let owner = session.username.clone();
    let shared = Arc::clone(inner);
    let outbox = outbox.clone();

    inner.pool.submit(move || {
        let response = finalize_commit(&shared, &owner, upload);
        outbox.send(response);
    });
    Ok(None)
}

/// Runs on a worker thread: rename, re-digest, verify, record.
fn finalize_commit(inner: &ServerInner, owner: &str, upload: UploadSession) -> Message {
    let logical_str = upload.logical.display().to_string();
    let result: Result<Message, HandlerError> = (|| {
        let final_path = inner.storage.finalize_upload(&upload.checkpoint)?;
        let actual_md5 = inner.storage.compute_md5(&final_path)?;

        if actual_md5 != upload.declared_md5 {
            warn!(
                owner,
                path = %logical_str,
                declared = %upload.declared_md5,
                actual = %actual_md5,
                "upload digest mismatch, discarding"
            );
            inner.storage.remove_file(&final_path)?;
            inner.storage.discard_checkpoint(&upload.checkpoint)?;
            return Ok(reply("FILE_UPLOAD_COMMIT", "md5_mismatch"));
        }

        inner.catalog.upsert(&FileRecord {
            owner: owner.to_string(),
            logical_path: logical_str.clone(),
            md5: actual_md5,
            storage_path: final_path.display().to_string(),
            size: upload.checkpoint.total,
        })?;
        info!(owner, path = %logical_str, size = upload.checkpoint.total, "upload committed");

        Ok(Message::new([
            ("cmd", "FILE_UPLOAD_COMMIT"),
            ("status", "ok"),
            ("path", logical_str.as_str()),
        ]))
    })();

    result.unwrap_or_else(|err| {
        let mut response = reply("FILE_UPLOAD_COMMIT", "error");
        response.set_header("reason", err.to_string());
        response
    })
}

fn download_init(
    inner: &ServerInner,
    session: &Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let Some(path) = required(request, "path") else {
        return Ok(Some(reply("FILE_DOWNLOAD_INIT", "invalid")));
    };

    let logical = normalize_relative(&session.cwd.join(path));
    let logical_str = logical.display().to_string();
    let absolute = inner.storage.resolve(&session.username, &logical)?;
    if !absolute.exists() {
        return Ok(Some(reply("FILE_DOWNLOAD_INIT", "notfound")));
    }

    let md5 = match inner.catalog.find_by_path(&session.username, &logical_str)? {
        Some(record) => record.md5,
        None => inner.storage.compute_md5(&absolute)?,
    };

    Ok(Some(Message::new([
        ("cmd", "FILE_DOWNLOAD_INIT"),
        ("status", "ok"),
        ("size", inner.storage.file_size(&absolute).to_string().as_str()),
        ("md5", md5.as_str()),
        ("path", logical_str.as_str()),
    ])))
}

fn download_fetch(
    inner: &ServerInner,
    session: &Session,
    request: &Message,
) -> Result<Option<Message>, HandlerError> {
    let (Some(path), Some(offset), Some(length)) = (
        required(request, "path"),
        required(request, "offset"),
        required(request, "length"),
    ) else {
        return Ok(Some(reply("FILE_DOWNLOAD_FETCH", "invalid")));
    };
    let (Ok(offset), Ok(length)) = (offset.parse::<u64>(), length.parse::<usize>()) else {
        return Ok(Some(reply("FILE_DOWNLOAD_FETCH", "invalid")));
    };

    let logical = normalize_relative(&session.cwd.join(path));
    let absolute = inner.storage.resolve(&session.username, &logical)?;
    if !absolute.exists() {
        return Ok(Some(reply("FILE_DOWNLOAD_FETCH", "notfound")));
    }

    let capped = length.min(inner.config.max_chunk_bytes);
    let chunk = inner.storage.read_chunk(&absolute, offset, capped)?;

    Ok(Some(Message::with_body(
        [
            ("cmd", "FILE_DOWNLOAD_FETCH"),
            ("status", if chunk.is_empty() { "done" } else { "ok" }),
            ("chunk", chunk.len().to_string().as_str()),
        ],
        chunk,
    )))
}
