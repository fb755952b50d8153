//! clusterd CLI: an interactive client for a running clusterd node's admin
//! API, talking HTTP since that's the crate's only external surface.

use std::io::Write;

use clusterd::VERSION;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7890";

#[tokio::main]
async fn main() {
    println!("clusterd-cli v{VERSION}");

    let base_url = std::env::var("CLUSTERD_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let token = std::env::var("CLUSTERD_TOKEN").unwrap_or_default();
    let user_id = std::env::var("CLUSTERD_USER").unwrap_or_default();
    println!("target: {base_url}");
    println!("type 'help' for commands, 'exit' to quit.");
    println!();

    let client = reqwest::Client::new();
    let mut reader = BufReader::new(stdin());
    let mut input = String::new();

    loop {
        print!("clusterd> ");
        let _ = std::io::stdout().flush();

        input.clear();
        if reader.read_line(&mut input).await.unwrap_or(0) == 0 {
            break;
        }
        let cmd = input.trim();
        if cmd.is_empty() {
            continue;
        }
        if cmd.eq_ignore_ascii_case("exit") || cmd.eq_ignore_ascii_case("quit") {
            println!("goodbye");
            break;
        }
        if cmd.eq_ignore_ascii_case("help") {
            print_help();
            continue;
        }

        let mut parts = cmd.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let result = match verb {
            "health" => get(&client, &base_url, &token, "/cluster/health").await,
            "nodes" => get(&client, &base_url, &token, "/cluster/nodes").await,
            "node" => match args.first() {
                Some(id) => get(&client, &base_url, &token, &format!("/cluster/nodes/{id}")).await,
                None => Err("usage: node <id>".to_string()),
            },
            "promote" => match args.first() {
                Some(id) => {
                    post_json(
                        &client,
                        &base_url,
                        &token,
                        "/cluster/nodes/promote",
                        serde_json::json!({"node_id": id, "force": args.get(1) == Some(&"force")}),
                    )
                    .await
                }
                None => Err("usage: promote <id> [force]".to_string()),
            },
            "demote" => match args.first() {
                Some(id) => post_json(&client, &base_url, &token, &format!("/cluster/nodes/{id}/demote"), serde_json::json!({})).await,
                None => Err("usage: demote <id>".to_string()),
            },
            "lag" => get(&client, &base_url, &token, "/cluster/replication/lag").await,
            "topology" => get(&client, &base_url, &token, "/cluster/topology").await,
            "collections" => migration_get(&client, &base_url, &user_id, "/migration/collections").await,
            "export" => match args.first() {
                Some(collections) => {
                    let collections: Vec<&str> = if *collections == "all" {
                        Vec::new()
                    } else {
                        collections.split(',').collect()
                    };
                    let mut body = serde_json::json!({"compression": args.get(1).copied().unwrap_or("gzip")});
                    if !collections.is_empty() {
                        body["collections"] = serde_json::json!(collections);
                    }
                    migration_post(&client, &base_url, &user_id, "/migration/export", body).await
                }
                None => Err("usage: export <collections,comma,separated|all> [compression]".to_string()),
            },
            "download" => match (args.first(), args.get(1)) {
                (Some(id), Some(out)) => download(&client, &base_url, &user_id, id, out).await,
                _ => Err("usage: download <migration_id> <output_path>".to_string()),
            },
            "upload" => match args.first() {
                Some(path) => upload(&client, &base_url, &user_id, path).await,
                None => Err("usage: upload <package_file>".to_string()),
            },
            "import" => match args.first() {
                Some(package_id) => {
                    migration_post(
                        &client,
                        &base_url,
                        &user_id,
                        "/migration/import",
                        serde_json::json!({
                            "migration_package_id": package_id,
                            "conflict_policy": args.get(1).copied().unwrap_or("last_write_wins"),
                        }),
                    )
                    .await
                }
                None => Err("usage: import <package_id> [conflict_policy]".to_string()),
            },
            "validate" => match args.first() {
                Some(package_id) => {
                    migration_post(
                        &client,
                        &base_url,
                        &user_id,
                        "/migration/import/validate",
                        serde_json::json!({"migration_package_id": package_id}),
                    )
                    .await
                }
                None => Err("usage: validate <package_id>".to_string()),
            },
            "rollback" => match args.first() {
                Some(id) => {
                    migration_post(
                        &client,
                        &base_url,
                        &user_id,
                        &format!("/migration/import/{id}/rollback?confirm=true"),
                        serde_json::json!({}),
                    )
                    .await
                }
                None => Err("usage: rollback <migration_id>".to_string()),
            },
            "history" => migration_get(&client, &base_url, &user_id, "/migration/history").await,
            "status" => match args.first() {
                Some(id) => migration_get(&client, &base_url, &user_id, &format!("/migration/{id}/status")).await,
                None => Err("usage: status <migration_id>".to_string()),
            },
            "instances" => migration_get(&client, &base_url, &user_id, "/migration/instances").await,
            "register-instance" => match (args.first(), args.get(1), args.get(2)) {
                (Some(name), Some(base), Some(api_key)) => {
                    migration_post(
                        &client,
                        &base_url,
                        &user_id,
                        "/migration/instances",
                        serde_json::json!({"name": name, "base_url": base, "api_key": api_key}),
                    )
                    .await
                }
                _ => Err("usage: register-instance <name> <base_url> <api_key>".to_string()),
            },
            "unregister-instance" => match args.first() {
                Some(id) => {
                    migration_delete(&client, &base_url, &user_id, &format!("/migration/instances/{id}")).await
                }
                None => Err("usage: unregister-instance <instance_id>".to_string()),
            },
            "transfer" => match (args.first(), args.get(1), args.get(2)) {
                (Some(source), Some(target), Some(collections)) => {
                    let collections: Vec<&str> = collections.split(',').collect();
                    migration_post(
                        &client,
                        &base_url,
                        &user_id,
                        "/migration/transfers",
                        serde_json::json!({
                            "source_instance_id": source,
                            "target_instance_id": target,
                            "collections": collections,
                        }),
                    )
                    .await
                }
                _ => Err("usage: transfer <source_instance_id> <target_instance_id> <collections,comma,separated>".to_string()),
            },
            "transfer-status" => match args.first() {
                Some(id) => migration_get(&client, &base_url, &user_id, &format!("/migration/transfers/{id}")).await,
                None => Err("usage: transfer-status <transfer_id>".to_string()),
            },
            "schedules" => migration_get(&client, &base_url, &user_id, "/migration/schedules").await,
            "schedule" => match (args.first(), args.get(1), args.get(2), args.get(3)) {
                (Some(source), Some(target), Some(collections), Some(cron_expression)) => {
                    let collections: Vec<&str> = collections.split(',').collect();
                    migration_post(
                        &client,
                        &base_url,
                        &user_id,
                        "/migration/schedules",
                        serde_json::json!({
                            "source_instance_id": source,
                            "target_instance_id": target,
                            "collections": collections,
                            "cron_expression": cron_expression,
                        }),
                    )
                    .await
                }
                _ => Err("usage: schedule <source_instance_id> <target_instance_id> <collections,comma,separated> <cron_expression>".to_string()),
            },
            "unschedule" => match args.first() {
                Some(id) => migration_delete(&client, &base_url, &user_id, &format!("/migration/schedules/{id}")).await,
                None => Err("usage: unschedule <schedule_id>".to_string()),
            },
            _ => Err(format!("unknown command: {verb} (type 'help')")),
        };

        match result {
            Ok(body) => println!("{body}"),
            Err(e) => println!("error: {e}"),
        }
        println!();
    }
}

fn print_help() {
    println!("commands:");
    println!("  health              aggregated cluster health");
    println!("  topology            current cluster topology");
    println!("  nodes               list known nodes");
    println!("  node <id>           fetch one node");
    println!("  promote <id> [force]  promote a replica to master");
    println!("  demote <id>         demote a master to replica");
    println!("  lag                 this node's replication lag");
    println!("  collections         list exportable collections");
    println!("  export <cols|all> [compression]  start an export, returns a migration id");
    println!("  download <id> <path>  save an export's package to a local file");
    println!("  upload <path>       upload a package file, returns a package id");
    println!("  import <package_id> [conflict_policy]  import an uploaded package");
    println!("  validate <package_id>  validate an uploaded package without importing");
    println!("  rollback <migration_id>  undo a previously applied import");
    println!("  history             this user's migration history");
    println!("  status <migration_id>  fetch one migration's record");
    println!("  instances           list registered remote instances");
    println!("  register-instance <name> <base_url> <api_key>  register a remote instance");
    println!("  unregister-instance <instance_id>  forget a remote instance");
    println!("  transfer <source_instance_id> <target_instance_id> <cols>  start a direct transfer");
    println!("  transfer-status <transfer_id>  fetch one transfer's progress");
    println!("  schedules           list recurring transfer schedules");
    println!("  schedule <source_instance_id> <target_instance_id> <cols> <cron>  create a recurring transfer");
    println!("  unschedule <schedule_id>  remove a recurring transfer");
    println!("  exit                quit");
    println!();
    println!("set CLUSTERD_USER to authenticate migration commands as a tenant owner.");
}

async fn get(client: &reqwest::Client, base_url: &str, token: &str, path: &str) -> Result<String, String> {
    let resp = client
        .get(format!("{base_url}{path}"))
        .header("X-Cluster-Token", token)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    pretty_body(resp).await
}

async fn post_json(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    path: &str,
    body: serde_json::Value,
) -> Result<String, String> {
    let resp = client
        .post(format!("{base_url}{path}"))
        .header("X-Cluster-Token", token)
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    pretty_body(resp).await
}

async fn migration_get(client: &reqwest::Client, base_url: &str, user_id: &str, path: &str) -> Result<String, String> {
    let resp = client
        .get(format!("{base_url}{path}"))
        .header("X-User-Id", user_id)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    pretty_body(resp).await
}

async fn migration_post(
    client: &reqwest::Client,
    base_url: &str,
    user_id: &str,
    path: &str,
    body: serde_json::Value,
) -> Result<String, String> {
    let resp = client
        .post(format!("{base_url}{path}"))
        .header("X-User-Id", user_id)
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    pretty_body(resp).await
}

async fn migration_delete(client: &reqwest::Client, base_url: &str, user_id: &str, path: &str) -> Result<String, String> {
    let resp = client
        .delete(format!("{base_url}{path}"))
        .header("X-User-Id", user_id)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    pretty_body(resp).await
}

async fn download(client: &reqwest::Client, base_url: &str, user_id: &str, migration_id: &str, out_path: &str) -> Result<String, String> {
    let resp = client
        .get(format!("{base_url}/migration/export/{migration_id}/download"))
        .header("X-User-Id", user_id)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(format!("{status}: {text}"));
    }
    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
    tokio::fs::write(out_path, &bytes).await.map_err(|e| e.to_string())?;
    Ok(format!("wrote {} bytes to {out_path}", bytes.len()))
}

async fn upload(client: &reqwest::Client, base_url: &str, user_id: &str, path: &str) -> Result<String, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let body = serde_json::json!({"data_hex": hex::encode(&bytes)});
    migration_post(client, base_url, user_id, "/migration/upload", body).await
}

async fn pretty_body(resp: reqwest::Response) -> Result<String, String> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| e.to_string())?;
    let pretty = serde_json::from_str::<serde_json::Value>(&text)
        .map(|v| serde_json::to_string_pretty(&v).unwrap_or(text.clone()))
        .unwrap_or(text);
    if status.is_success() {
        Ok(pretty)
    } else {
        Err(format!("{status}: {pretty}"))
    }
}
