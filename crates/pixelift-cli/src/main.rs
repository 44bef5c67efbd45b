use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pixelift_contracts::chat::ChatTurn;
use pixelift_engine::{
    decode_data_uri, Delivery, EnhanceOptions, Studio, StudioConfig,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "pixelift", version, about = "Image studio front end for hosted inference models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restore faces in an uploaded photo; the result lands in the uploads
    /// directory and is reported by its public path.
    Restore(RestoreArgs),
    /// Generate an image from a text prompt.
    Generate(GenerateArgs),
    /// Edit an uploaded photo with a text instruction.
    Transform(TransformArgs),
    /// Turn an uploaded face into a sticker.
    Sticker(StickerArgs),
    /// Run CodeFormer enhancement on an already-hosted image URL.
    Enhance(EnhanceArgs),
    /// Interactive assistant chat.
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct RestoreArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "uploads")]
    uploads: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "uploads")]
    uploads: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct TransformArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "uploads")]
    uploads: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct StickerArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "uploads")]
    uploads: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct EnhanceArgs {
    #[arg(long)]
    image_url: String,
    #[arg(long)]
    upscale: Option<u32>,
    #[arg(long)]
    fidelity: Option<f64>,
    #[arg(long)]
    no_face_upsample: bool,
    #[arg(long)]
    no_background_enhance: bool,
    #[arg(long, default_value = "uploads")]
    uploads: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "uploads")]
    uploads: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", json!({ "error": format!("{err:#}") }));
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Restore(args) => run_restore(args),
        Command::Generate(args) => run_generate(args),
        Command::Transform(args) => run_transform(args),
        Command::Sticker(args) => run_sticker(args),
        Command::Enhance(args) => run_enhance(args),
        Command::Chat(args) => run_chat(args),
    }?;
    Ok(0)
}

fn build_studio(uploads: PathBuf, events: Option<PathBuf>, dryrun: bool) -> Studio {
    let config = StudioConfig {
        uploads_root: uploads,
        events_path: events,
    };
    if dryrun {
        Studio::dryrun(config)
    } else {
        Studio::new(config)
    }
}

fn read_upload(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed reading {}", path.display()))
}

fn upload_name(path: &Path) -> String {
    path.file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("upload")
        .to_string()
}

fn print_delivery(delivery: &Delivery, out: Option<&Path>) -> Result<()> {
    let mut response = json!({ "outputImage": delivery.output_image() });
    if let Delivery::Stored { path, .. } = delivery {
        response["path"] = json!(path.display().to_string());
    }
    if let Some(out) = out {
        let bytes = delivery_bytes(delivery)?;
        fs::write(out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
        response["saved"] = json!(out.display().to_string());
    }
    println!("{response}");
    Ok(())
}

fn delivery_bytes(delivery: &Delivery) -> Result<Vec<u8>> {
    match delivery {
        Delivery::Inline { data_uri, .. } => {
            decode_data_uri(data_uri).context("inline result is not a base64 data URI")
        }
        Delivery::Stored { path, .. } => {
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))
        }
    }
}

fn run_restore(args: RestoreArgs) -> Result<()> {
    let studio = build_studio(args.uploads, args.events, args.dryrun);
    let upload = read_upload(&args.image)?;
    let delivery = studio.restore(&upload)?;
    print_delivery(&delivery, None)
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let studio = build_studio(args.uploads, args.events, args.dryrun);
    let delivery = studio.generate(&args.prompt)?;
    print_delivery(&delivery, args.out.as_deref())
}

fn run_transform(args: TransformArgs) -> Result<()> {
    let studio = build_studio(args.uploads, args.events, args.dryrun);
    let upload = read_upload(&args.image)?;
    let delivery = studio.transform(&upload, &upload_name(&args.image), &args.prompt)?;
    print_delivery(&delivery, args.out.as_deref())
}

fn run_sticker(args: StickerArgs) -> Result<()> {
    let studio = build_studio(args.uploads, args.events, args.dryrun);
    let upload = read_upload(&args.image)?;
    let delivery = studio.sticker(&upload)?;
    print_delivery(&delivery, args.out.as_deref())
}

fn run_enhance(args: EnhanceArgs) -> Result<()> {
    let studio = build_studio(args.uploads, args.events, args.dryrun);
    let options = EnhanceOptions {
        upscale: args.upscale,
        face_upsample: Some(!args.no_face_upsample),
        background_enhance: Some(!args.no_background_enhance),
        fidelity: args.fidelity,
    };
    let url = studio.enhance(&args.image_url, &options)?;
    println!("{}", json!({ "outputImage": url }));
    Ok(())
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let studio = build_studio(args.uploads, args.events, args.dryrun);
    let mut history: Vec<ChatTurn> = Vec::new();

    println!("¡Bienvenido! ¿En qué puedo ayudarte hoy? (escribe 'salir' para terminar)");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message.eq_ignore_ascii_case("salir") || message.eq_ignore_ascii_case("exit") {
            break;
        }
        match studio.chat(message, &history) {
            Ok(reply) => {
                println!("{}", reply.trim());
                history.push(ChatTurn::user(message));
                history.push(ChatTurn::assistant(reply.trim().to_string()));
            }
            Err(err) => {
                eprintln!("{}", json!({ "error": format!("{err:#}") }));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_every_subcommand() {
        Cli::try_parse_from(["pixelift", "restore", "--image", "a.png"]).expect("restore");
        Cli::try_parse_from(["pixelift", "generate", "--prompt", "a cat", "--dryrun"])
            .expect("generate");
        Cli::try_parse_from([
            "pixelift",
            "transform",
            "--image",
            "a.png",
            "--prompt",
            "make it snow",
            "--out",
            "result.webp",
        ])
        .expect("transform");
        Cli::try_parse_from(["pixelift", "sticker", "--image", "a.png"]).expect("sticker");
        Cli::try_parse_from([
            "pixelift",
            "enhance",
            "--image-url",
            "https://host/a.png",
            "--fidelity",
            "0.5",
        ])
        .expect("enhance");
        Cli::try_parse_from(["pixelift", "chat"]).expect("chat");
    }

    #[test]
    fn inline_deliveries_decode_back_to_bytes() -> Result<()> {
        let delivery = Delivery::Inline {
            data_uri: pixelift_engine::data_uri("image/png", b"fake"),
            media_type: "image/png".to_string(),
        };
        assert_eq!(delivery_bytes(&delivery)?, b"fake");
        Ok(())
    }

    #[test]
    fn stored_deliveries_read_from_disk() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("result.png");
        fs::write(&path, b"stored")?;
        let delivery = Delivery::Stored {
            file_name: "result.png".to_string(),
            public_path: "/uploads/result.png".to_string(),
            path,
            media_type: "image/png".to_string(),
        };
        assert_eq!(delivery_bytes(&delivery)?, b"stored");
        Ok(())
    }
}
