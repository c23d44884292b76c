//! `dicomnode` CLI: thin wrappers over the core for ad-hoc inspection and
//! sending of DICOM files, mirroring the original `dicomnode.tools.show`/
//! `dicomnode.tools.store` scripts. Exit code 0 on success, non-zero on
//! DIMSE failure or a file that could not be parsed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dicomnode::dicom::make_meta;
use dicomnode::tree::DicomTree;

#[derive(Parser, Debug)]
#[command(name = "dicomnode", about = "DICOM ingestion pipeline toolkit")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Display a DICOM file's dataset.
    Show {
        /// Path to the DICOM file to display.
        dicomfile: PathBuf,
        /// Stop on the first file that fails to parse (default: warn and skip).
        #[arg(long, default_value_t = false)]
        strict_parsing: bool,
    },
    /// Send a C-STORE DIMSE message for every DICOM file under the given paths.
    Store {
        /// IP of the peer SCP.
        ip: String,
        /// Port of the peer SCP.
        port: u16,
        /// The AE title of the peer SCP.
        scp_ae: String,
        /// Our own AE title.
        scu_ae: String,
        /// One or more DICOM files or directories to send.
        #[arg(required = true)]
        path: Vec<PathBuf>,
        /// Stop on the first file that fails to parse (default: warn and skip).
        #[arg(long, default_value_t = false)]
        strict_parsing: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Show {
            dicomfile,
            strict_parsing,
        } => show(&dicomfile, strict_parsing),
        Cmd::Store {
            ip,
            port,
            scp_ae,
            scu_ae,
            path,
            strict_parsing,
        } => store(ip, port, scp_ae, scu_ae, path, strict_parsing).await,
    }
}

fn show(path: &std::path::Path, strict_parsing: bool) -> ExitCode {
    match dicom_object::open_file(path) {
        Ok(object) => {
            println!("{object:#?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to read {}: {e}", path.display());
            if strict_parsing {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
    }
}

/// Load every DICOM object reachable from `paths` (files sent as-is,
/// directories discovered recursively), promoting directory-discovered
/// datasets back to file-meta-bearing objects before sending.
fn collect_objects(
    paths: &[PathBuf],
    strict_parsing: bool,
) -> Result<Vec<dicom_object::FileDicomObject<dicom_object::InMemDicomObject>>, String> {
    let mut objects = Vec::new();
    for path in paths {
        if path.is_dir() {
            let tree = DicomTree::discover(path, strict_parsing).map_err(|e| e.to_string())?;
            let mut load_error = None;
            tree.map(|dataset| {
                if load_error.is_some() {
                    return;
                }
                match make_meta(dataset.clone(), true, true) {
                    Ok(object) => objects.push(object),
                    Err(e) => load_error = Some(e.to_string()),
                }
            });
            if let Some(e) = load_error {
                return Err(e);
            }
        } else {
            match dicom_object::open_file(path) {
                Ok(object) => objects.push(object),
                Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
            }
        }
    }
    Ok(objects)
}

async fn store(
    ip: String,
    port: u16,
    scp_ae: String,
    scu_ae: String,
    paths: Vec<PathBuf>,
    strict_parsing: bool,
) -> ExitCode {
    let address = dimse::Address::new(ip.clone(), port, scp_ae.clone());

    let objects = match collect_objects(&paths, strict_parsing) {
        Ok(objects) => objects,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if objects.is_empty() {
        eprintln!("no DICOM objects found under the given path(s)");
        return ExitCode::FAILURE;
    }

    match dimse::send_images(scu_ae, address.clone(), objects).await {
        Ok(status) if status == dimse::status::SUCCESS => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("C-STORE to {address} returned non-success status {status:04X}H");
            ExitCode::FAILURE
        }
        Err(_) => {
            eprintln!(
                "Could not connect to the SCP with the following inputs:\nIP: {ip}\nPort: {port}\nSCP AE: {scp_ae}"
            );
            ExitCode::FAILURE
        }
    }
}
