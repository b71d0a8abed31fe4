//! Upload and download subcommands.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Args;
use tokio::fs::File;
use tokio::io::BufReader;

use tierfs_proto::constants::NAME_SUFFIX_LEN;
use tierfs_proto::defaults::DEFAULT_CHUNK_SIZE;
use tierfs_proto::node::parse_group_path;

use crate::common::{connect_master, connect_storage, exit_error, format_size, parse_size};

#[derive(Args)]
pub struct UploadArgs {
    /// Local file to store
    file: PathBuf,

    /// Name to store it under (default: the local file name)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Upload chunk size, with optional K/M/G suffix
    #[arg(short = 'c', long, value_parser = parse_size, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Args)]
pub struct DownloadArgs {
    /// Stored path as printed by upload, "<group>/<path>"
    path: String,

    /// Output file, "-" for stdout (default: the stored name)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

pub async fn upload(master: SocketAddr, args: UploadArgs) {
    let name = match args.name {
        Some(n) => n,
        None => match args.file.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => exit_error(&format!("{}: not a file", args.file.display())),
        },
    };

    let file = match File::open(&args.file).await {
        Ok(f) => f,
        Err(e) => exit_error(&format!("{}: {}", args.file.display(), e)),
    };
    let size = match file.metadata().await {
        Ok(m) if m.is_file() => m.len(),
        Ok(_) => exit_error(&format!("{}: not a regular file", args.file.display())),
        Err(e) => exit_error(&format!("{}: {}", args.file.display(), e)),
    };

    let master = connect_master(master).await;
    let node = match master.locate_upload(size).await {
        Ok(n) => n,
        Err(e) => exit_error(&format!("no storage for {}: {}", format_size(size), e)),
    };
    master.close();

    let storage = connect_storage(node.addr).await;
    match storage
        .upload(&name, size, BufReader::new(file), args.chunk_size)
        .await
    {
        Ok(path) => println!("{}", path),
        Err(e) => exit_error(&format!("upload to {} failed: {}", node, e)),
    }
    storage.close();
}

pub async fn download(master: SocketAddr, args: DownloadArgs) {
    let group_id = match parse_group_path(&args.path) {
        Ok((g, _)) => g,
        Err(_) => exit_error(&format!("{}: not a stored path", args.path)),
    };

    let master = connect_master(master).await;
    let node = match master.locate_download(group_id).await {
        Ok(n) => n,
        Err(e) => exit_error(&format!("no storage node in group {}: {}", group_id, e)),
    };
    master.close();

    let storage = connect_storage(node.addr).await;
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(stored_name(&args.path)));
    let res = if output == Path::new("-") {
        storage.download(&args.path, tokio::io::stdout()).await
    } else {
        match File::create(&output).await {
            Ok(f) => storage.download(&args.path, f).await,
            Err(e) => exit_error(&format!("{}: {}", output.display(), e)),
        }
    };
    storage.close();

    match res {
        Ok(n) => tracing::debug!("downloaded {} from {}", format_size(n), node),
        Err(e) => {
            if output != Path::new("-") {
                let _ = std::fs::remove_file(&output);
            }
            exit_error(&format!("download from {} failed: {}", node, e))
        }
    }
}

/// Original file name of a stored path, without the random suffix.
fn stored_name(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rsplit_once('_') {
        Some((stem, suffix)) if !stem.is_empty() && suffix.len() == NAME_SUFFIX_LEN => stem,
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_name() {
        assert_eq!(stored_name("2/AB/CD/movie.mkv_aB3dE5gH"), "movie.mkv");
        assert_eq!(stored_name("2/AB/CD/my_file_aB3dE5gH"), "my_file");
        assert_eq!(stored_name("2/AB/CD/plain"), "plain");
        assert_eq!(stored_name("2/AB/CD/_aB3dE5gH"), "_aB3dE5gH");
    }
}
