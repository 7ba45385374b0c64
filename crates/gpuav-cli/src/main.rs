mod dump;

use clap::{Parser, Subcommand};
use tracing::info;

use gpuav_core::config::{default_config_path, GpuAvConfig};
use gpuav_core::printf::FormatFile;
use gpuav_core::FormatTable;
use gpuav_protocol::{FormatString, ValueMasks};

#[derive(Parser)]
#[command(name = "gpuav")]
#[command(about = "GPU-assisted validation - offline tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw dump of an error output buffer
    Decode {
        /// Little-endian u32 dump, header words included
        dump: String,

        /// Format-string table (TOML) used to render printf records
        #[arg(short, long)]
        formats: Option<String>,
    },

    /// Render a printf format string against payload words
    Printf {
        /// Format string, e.g. "x=%d pos=%v2f"
        #[arg(short, long)]
        format: String,

        /// Payload words, comma separated, decimal or 0x-prefixed hex
        #[arg(short, long, value_delimiter = ',')]
        words: Vec<String>,

        /// Bit i set: value i is 64-bit
        #[arg(long, default_value = "0")]
        float64_mask: String,

        /// Bit i set: value i is a signed 8-bit integer
        #[arg(long, default_value = "0")]
        signed8_mask: String,

        /// Bit i set: value i is a signed 16-bit integer
        #[arg(long, default_value = "0")]
        signed16_mask: String,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file path (default: $GPUAV_CONFIG, /etc/gpuav/gpuav.toml, ./gpuav.toml)
        #[arg(short, long)]
        path: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    gpuav_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decode { dump, formats } => {
            let table = FormatTable::new();
            if let Some(ref path) = formats {
                let file = FormatFile::load(std::path::Path::new(path))?;
                let count = table.load(&file)?;
                info!("loaded {} format strings from {}", count, path);
            }
            let bytes = std::fs::read(&dump)?;
            let words = gpuav_protocol::output::words_from_dump(&bytes)?;
            let mut out = std::io::stdout().lock();
            dump::print_report(&mut out, &words, formats.is_some().then_some(&table))?;
        }

        Commands::Printf {
            format,
            words,
            float64_mask,
            signed8_mask,
            signed16_mask,
        } => {
            let words = words
                .iter()
                .map(|w| dump::parse_word(w))
                .collect::<anyhow::Result<Vec<u32>>>()?;
            let masks = ValueMasks {
                float64: dump::parse_word(&float64_mask)?,
                signed8: dump::parse_word(&signed8_mask)?,
                signed16: dump::parse_word(&signed16_mask)?,
            };
            let parsed = FormatString::parse(&format)?;
            let (text, consumed) = parsed.render_words(&words, masks)?;
            println!("{}", text);
            if consumed < words.len() {
                eprintln!(
                    "note: {} of {} payload words unused",
                    words.len() - consumed,
                    words.len()
                );
            }
        }

        Commands::Config { path } => {
            let path = path.unwrap_or_else(default_config_path);
            let config = if std::path::Path::new(&path).exists() {
                info!("reading configuration from {}", path);
                GpuAvConfig::load(&path)?
            } else {
                info!("{} not found, showing defaults", path);
                GpuAvConfig::default()
            };
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}
