//! Delete a file from a stashd instance by its delivery URL.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "stash-del", about = "Delete a file from a stashd instance")]
struct Args {
    /// Delivery URL of the file to delete.
    #[arg(long)]
    url: String,

    /// Username for authentication.
    #[arg(long, default_value = "admin")]
    user: String,

    /// Password for authentication.
    #[arg(long)]
    pass: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let response = reqwest::Client::new()
        .delete(&args.url)
        .basic_auth(&args.user, Some(&args.pass))
        .send()
        .await
        .unwrap_or_else(|e| {
            eprintln!("Request failed: {e}");
            std::process::exit(1);
        });

    if response.status() != reqwest::StatusCode::NO_CONTENT {
        eprintln!("Request failed: HTTP code = {}", response.status());
        if let Ok(body) = response.text().await {
            eprintln!("Additional output: {body}");
        }
        std::process::exit(1);
    }

    println!("OK");
}
