use std::env;

const USAGE: &str = "Usage: insight <serve|worker|poll|provision|token> --config <path> \
[--sub <subject>] [--group <name>]...";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if !matches!(
        cmd.as_str(),
        "serve" | "worker" | "poll" | "provision" | "token"
    ) {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    let mut subject = String::from("operator");
    let mut groups: Vec<String> = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(v) = args.next() {
                    config_path = v;
                }
            }
            "--sub" => {
                if let Some(v) = args.next() {
                    subject = v;
                }
            }
            "--group" => {
                if let Some(v) = args.next() {
                    groups.push(v);
                }
            }
            other => {
                eprintln!("unknown argument: {other}\n{USAGE}");
                std::process::exit(2);
            }
        }
    }

    let cfg = match insight_config::load(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    insight_config::init_tracing(&cfg.logging.level);

    let result = match cmd.as_str() {
        "serve" => insight_server::serve(cfg).await,
        "worker" => insight_server::run_worker_once(cfg)
            .await
            .and_then(|report| print_json(&report)),
        "poll" => insight_server::run_poll_once(cfg)
            .await
            .and_then(|summary| print_json(&summary)),
        "provision" => insight_server::provision(cfg).await.map(|created| {
            if created.is_empty() {
                println!("all tables already exist");
            }
            for table in created {
                println!("created table {table}");
            }
        }),
        _ => insight_server::issue_token(&cfg, &subject, &groups).map(|token| println!("{token}")),
    };

    if let Err(e) = result {
        tracing::error!(command = %cmd, error = %e, "command failed");
        eprintln!("{cmd} failed: {e}");
        std::process::exit(1);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}
