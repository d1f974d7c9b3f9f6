//! rolechat - 角色陪伴聊天服务
//!
//! 入口：加载配置、初始化日志、装配 App、启动后台工作池，
//! 然后从 stdin 逐行读取 JSON 请求，把结果逐行写到 stdout（日志走 stderr）。
//!
//! ```text
//! {"op":"send","user_id":1,"role_id":2,"message":"早安"}
//! {"ok":true,"data":{"turn":{...},"favorability":1,"continuous_days":1}}
//! ```

use std::path::PathBuf;

use anyhow::Context;
use rolechat::app::App;
use rolechat::config::load_config;
use rolechat::core::{ChatError, Role, RoleId, TurnId, UserId, UserPresumption};
use rolechat::memory::SubCategory;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

fn default_mode() -> u64 {
    1
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

/// 已完成鉴权的请求：user_id 由上游从 token 解析得到
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    SaveRole {
        role: Role,
    },
    Send {
        user_id: UserId,
        role_id: RoleId,
        #[serde(default = "default_mode")]
        mode_id: u64,
        message: String,
    },
    Regenerate {
        user_id: UserId,
        turn_id: TurnId,
        #[serde(default = "default_mode")]
        mode_id: u64,
        message: String,
    },
    History {
        user_id: UserId,
        role_id: RoleId,
        #[serde(default = "default_page")]
        page: u64,
        #[serde(default = "default_per_page")]
        per_page: u64,
    },
    MarkRead {
        user_id: UserId,
        role_id: RoleId,
    },
    Clear {
        user_id: UserId,
        role_id: RoleId,
    },
    Relationship {
        user_id: UserId,
        role_id: RoleId,
    },
    InnerThought {
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    },
    Thoughts {
        user_id: UserId,
        role_id: RoleId,
        #[serde(default = "default_page")]
        page: u64,
        #[serde(default = "default_per_page")]
        per_page: u64,
    },
    SavePresumption {
        user_id: UserId,
        role_id: RoleId,
        presumption: UserPresumption,
    },
    ViewPresumption {
        user_id: UserId,
        role_id: RoleId,
    },
    AddEvent {
        user_id: UserId,
        role_id: RoleId,
        title: String,
        content: String,
    },
    ListEvents {
        user_id: UserId,
        role_id: RoleId,
    },
    Memories {
        user_id: UserId,
        role_id: RoleId,
        sub_category: SubCategory,
        #[serde(default = "default_page")]
        page: u64,
        #[serde(default = "default_per_page")]
        per_page: u64,
    },
    Diaries {
        user_id: UserId,
        role_id: RoleId,
        #[serde(default = "default_page")]
        page: u64,
        #[serde(default = "default_per_page")]
        per_page: u64,
    },
    EditMemory {
        user_id: UserId,
        id: u64,
        content: String,
    },
    DeleteMemory {
        user_id: UserId,
        id: u64,
    },
}

fn to_value<T: serde::Serialize>(v: T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

async fn dispatch(app: &App, request: Request) -> Result<Value, ChatError> {
    match request {
        Request::SaveRole { role } => {
            let id = app.repos.roles.save_role(role).await?;
            Ok(json!({ "role_id": id }))
        }
        Request::Send {
            user_id,
            role_id,
            mode_id,
            message,
        } => Ok(to_value(app.chat.send(user_id, role_id, mode_id, &message).await?)),
        Request::Regenerate {
            user_id,
            turn_id,
            mode_id,
            message,
        } => Ok(to_value(app.chat.regenerate(user_id, turn_id, mode_id, &message).await?)),
        Request::History {
            user_id,
            role_id,
            page,
            per_page,
        } => Ok(to_value(app.chat.history(user_id, role_id, page, per_page).await?)),
        Request::MarkRead { user_id, role_id } => {
            let updated = app.chat.mark_read(user_id, role_id).await?;
            Ok(json!({ "updated": updated }))
        }
        Request::Clear { user_id, role_id } => {
            let cleared = app.chat.clear(user_id, role_id).await?;
            Ok(json!({ "cleared": cleared }))
        }
        Request::Relationship { user_id, role_id } => {
            Ok(to_value(app.chat.relationship(user_id, role_id).await?))
        }
        Request::InnerThought {
            user_id,
            role_id,
            turn_id,
        } => Ok(to_value(app.chat.inner_thought(user_id, role_id, turn_id).await?)),
        Request::Thoughts {
            user_id,
            role_id,
            page,
            per_page,
        } => Ok(to_value(app.chat.thoughts(user_id, role_id, page, per_page).await?)),
        Request::SavePresumption {
            user_id,
            role_id,
            presumption,
        } => {
            app.presumptions.save(user_id, role_id, presumption).await?;
            Ok(Value::Null)
        }
        Request::ViewPresumption { user_id, role_id } => {
            Ok(to_value(app.presumptions.view(user_id, role_id).await?))
        }
        Request::AddEvent {
            user_id,
            role_id,
            title,
            content,
        } => Ok(to_value(app.events.add(user_id, role_id, &title, &content).await?)),
        Request::ListEvents { user_id, role_id } => {
            Ok(to_value(app.events.list(role_id, user_id).await?))
        }
        Request::Memories {
            user_id,
            role_id,
            sub_category,
            page,
            per_page,
        } => Ok(to_value(
            app.memories
                .list(user_id, role_id, sub_category, page, per_page)
                .await?,
        )),
        Request::Diaries {
            user_id,
            role_id,
            page,
            per_page,
        } => Ok(to_value(app.memories.diaries(user_id, role_id, page, per_page).await?)),
        Request::EditMemory {
            user_id,
            id,
            content,
        } => {
            app.memories.edit(user_id, id, &content).await?;
            Ok(Value::Null)
        }
        Request::DeleteMemory { user_id, id } => {
            app.memories.delete(user_id, id).await?;
            Ok(Value::Null)
        }
    }
}

async fn handle_line(app: &App, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed request line");
            return json!({ "ok": false, "error": format!("invalid request: {e}") });
        }
    };
    match dispatch(app, request).await {
        Ok(data) => json!({ "ok": true, "data": data }),
        Err(e) => {
            if !e.is_user_visible() {
                error!(error = ?e, "request failed");
            }
            json!({ "ok": false, "error": e.to_string() })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rolechat::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let app = App::from_config(&cfg)
        .await
        .context("Failed to build app")?;
    let workers = app.start_workers();
    info!(
        storage = %cfg.storage.backend,
        workers = cfg.summarizer.workers,
        "rolechat ready, reading requests from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handle_line(&app, line).await;
        stdout
            .write_all(format!("{response}\n").as_bytes())
            .await
            .context("Failed to write response")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }

    info!("stdin closed, shutting down");
    app.shutdown();
    if let Some(handle) = workers {
        let _ = handle.await;
    }
    Ok(())
}
