use std::path::PathBuf;

use mediafetch_engine::paths::AppPaths;
use mediafetch_engine::{logging, Engine};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut install_ffmpeg = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--install-ffmpeg" => install_ffmpeg = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;

    let paths = AppPaths::new(base_dir);
    logging::init(&paths).map_err(|e| e.to_string())?;
    let engine = Engine::open(paths).map_err(|e| e.to_string())?;

    println!("Base dir: {}", engine.paths().base_dir.to_string_lossy());

    let fetcher = engine.check_fetcher_available();
    match fetcher.version.as_deref() {
        Some(version) => println!("yt-dlp: {version} ({})", fetcher.path),
        None => println!("yt-dlp: not found (looked for {})", fetcher.path),
    }

    let status = engine.check_transcoder_available();
    if status.available || !install_ffmpeg {
        println!("FFmpeg: {}", status.detail);
        return Ok(());
    }

    println!("FFmpeg: installing...");
    let mut last_percent = -1_i64;
    let next = engine
        .install_transcoder(|progress| {
            let percent = progress.percent.floor() as i64;
            if percent / 10 != last_percent / 10 {
                println!("FFmpeg: {percent}%");
                last_percent = percent;
            }
        })
        .map_err(|e| e.to_string())?;
    if !next.available {
        return Err("FFmpeg install did not result in a working ffmpeg".to_string());
    }
    println!("FFmpeg: installed ({})", next.path);
    Ok(())
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("MEDIAFETCH_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("mediafetch"));
            }
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let t = home.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t).join(".mediafetch"));
        }
    }

    None
}

fn print_help() {
    println!(
        r#"mediafetch_setup

Reports the fetcher and transcoder the engine will use, and installs FFmpeg
into the app data directory when asked.

Usage:
  cargo run --bin mediafetch_setup
  cargo run --bin mediafetch_setup -- --install-ffmpeg

Options:
  --base-dir <path>   Override base dir (default: $MEDIAFETCH_BASE_DIR, %APPDATA%\mediafetch or ~/.mediafetch)
  --install-ffmpeg    Download and install FFmpeg into <base-dir>/resources when missing
"#
    );
}
