//! Upload a file to a stashd instance and print the delivery URLs.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stash-put", about = "Upload a file to a stashd instance")]
struct Args {
    /// Destination instance to upload to.
    #[arg(long, default_value = "http://localhost:8080")]
    dest: String,

    /// MIME type of the file.
    #[arg(long, default_value = "application/octet-stream")]
    mimetype: String,

    /// File to upload.
    #[arg(long)]
    file: PathBuf,

    /// Drawer name.
    #[arg(long)]
    drawer: String,

    /// Authentication information in the format username:password.
    #[arg(long)]
    auth: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let content = std::fs::read(&args.file).unwrap_or_else(|e| {
        eprintln!("Error: couldn't open {}: {e}", args.file.display());
        std::process::exit(1);
    });

    let ext = args
        .file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();

    let part = reqwest::multipart::Part::bytes(content)
        .mime_str(&args.mimetype)
        .unwrap_or_else(|e| {
            eprintln!("Error: invalid MIME type: {e}");
            std::process::exit(1);
        });
    let form = reqwest::multipart::Form::new().part("file", part);

    let mut request = reqwest::Client::new()
        .post(format!(
            "{}/api/upload?drawer={}&ext={ext}",
            args.dest, args.drawer
        ))
        .multipart(form);
    if let Some(auth) = &args.auth {
        let Some((user, pass)) = auth.split_once(':') else {
            eprintln!("Error: authentication information must be in the format username:password!");
            std::process::exit(1);
        };
        request = request.basic_auth(user, Some(pass));
    }

    let response = request.send().await.unwrap_or_else(|e| {
        eprintln!("Error: upload failed: {e}");
        std::process::exit(1);
    });
    if !response.status().is_success() {
        eprintln!("Error: upload failed: HTTP code = {}", response.status());
        if let Ok(body) = response.text().await {
            eprintln!("{body}");
        }
        std::process::exit(1);
    }

    let urls: Vec<String> = response.json().await.unwrap_or_else(|e| {
        eprintln!("Decoding response failed: {e}");
        std::process::exit(1);
    });
    for url in urls {
        println!("{url}");
    }
}
