//! Trace-capture tool: runs a binary under an emulator's gdbstub and writes a
//! delta-compressed JSON execution trace.

use calvados::gdb::{RemoteTarget, Stream};
use calvados::trace::reader::TraceReader;
use calvados::trace::writer::{CaptureOptions, MemoryProbe, Probe, RegisterSetProbe, TraceWriter};
use clap::{Parser, ValueEnum};
use log::{info, LevelFilter};
use object::{Object, ObjectSection};
use std::error::Error;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::process::{Child, Command};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Emulator {
    /// The reference Thumb-2 simulator's gdbserver.
    T2sim,
    /// qemu-system-arm.
    Qemu,
    /// No emulator is forked; the listening socket path is printed and the
    /// user connects one manually.
    User,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ImgFormat {
    /// Flat binary image.
    Bin,
    /// ELF image; loadable sections are placed relative to the ROM base.
    Elf,
    /// Take the ROM image and memory layout from an existing trace file.
    Trace,
}

/// Execute a binary under an emulator and write a JSON trace file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// ROM base address. Only relevant when a binary is given as input file.
    #[arg(long, value_parser = parse_address, default_value = "0")]
    rom_base: u32,

    /// RAM base address.
    #[arg(long, value_parser = parse_address, default_value = "0x20000000")]
    ram_base: u32,

    /// RAM size in bytes.
    #[arg(long, value_parser = parse_address, default_value = "0x2000")]
    ram_size: u32,

    /// Record only every n-th step.
    #[arg(short, long, default_value_t = 1)]
    decimation: u64,

    /// Abort after a maximum of n executed instructions (0: no limit).
    #[arg(long, default_value_t = 0)]
    max_insn_cnt: u64,

    /// Emulator driven through the remote debug protocol.
    #[arg(short, long, value_enum, default_value_t = Emulator::T2sim)]
    emulator: Emulator,

    /// Full path of the emulator binary; defaults to t2sim-gdbserver or
    /// qemu-system-arm depending on the emulator choice.
    #[arg(long)]
    emulator_binary: Option<String>,

    /// Create the listening Unix socket at this path instead of a temporary
    /// location.
    #[arg(long)]
    unix_socket: Option<String>,

    /// Input image format.
    #[arg(short, long, value_enum, default_value_t = ImgFormat::Bin)]
    img_format: ImgFormat,

    /// Show more verbose output. Can be given multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Binary image (or trace file) to load into the emulator.
    img_filename: String,

    /// JSON trace file to write.
    trc_filename: String,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("bad address {:?}", s))
}

/// Loads the ROM image and resolves the effective memory layout.
fn load_image(args: &Args) -> Result<(Vec<u8>, u32, u32, u32), Box<dyn Error>> {
    match args.img_format {
        ImgFormat::Bin => {
            let image = std::fs::read(&args.img_filename)?;
            Ok((image, args.rom_base, args.ram_base, args.ram_size))
        }
        ImgFormat::Elf => {
            let data = std::fs::read(&args.img_filename)?;
            let object = object::File::parse(&*data)?;
            let mut image = Vec::new();
            for name in [".text", ".rodata", ".data"] {
                if let Some(section) = object.section_by_name(name) {
                    let offset = (section.address() as u32).wrapping_sub(args.rom_base) as usize;
                    let bytes = section.uncompressed_data()?;
                    if image.len() < offset + bytes.len() {
                        image.resize(offset + bytes.len(), 0);
                    }
                    image[offset..offset + bytes.len()].copy_from_slice(&bytes);
                }
            }
            Ok((image, args.rom_base, args.ram_base, args.ram_size))
        }
        ImgFormat::Trace => {
            let reader = TraceReader::open(&args.img_filename)?;
            let meta = reader.meta();
            Ok((
                meta.rom_image.clone(),
                meta.rom_base,
                meta.ram_base,
                meta.ram_size,
            ))
        }
    }
}

/// Forks the selected emulator, pointed at our listening socket.
fn spawn_emulator(
    args: &Args,
    socket_path: &str,
    rom_file: &str,
) -> Result<Option<Child>, Box<dyn Error>> {
    Ok(match args.emulator {
        Emulator::User => {
            println!("listening on {}", socket_path);
            None
        }
        Emulator::Qemu => {
            let binary = args.emulator_binary.as_deref().unwrap_or("qemu-system-arm");
            Some(
                Command::new(binary)
                    .args(["-S", "-machine", "lm3s6965evb", "-display", "none"])
                    .args(["-monitor", "none"])
                    .args(["-gdb", &format!("unix:{}", socket_path)])
                    .args(["-kernel", rom_file])
                    .spawn()?,
            )
        }
        Emulator::T2sim => {
            let binary = args.emulator_binary.as_deref().unwrap_or("t2sim-gdbserver");
            Some(Command::new(binary).args([rom_file, socket_path]).spawn()?)
        }
    })
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let (rom_image, rom_base, ram_base, ram_size) = load_image(args)?;
    info!(
        "rom 0x{:08x}+0x{:x}, ram 0x{:08x}+0x{:x}",
        rom_base,
        rom_image.len(),
        ram_base,
        ram_size
    );

    // The emulator reads the image from a file; rewrite it in case the input
    // was an ELF or a trace.
    let workdir = tempfile::tempdir()?;
    let rom_file = workdir.path().join("rom.bin");
    std::fs::File::create(&rom_file)?.write_all(&rom_image)?;
    let socket_path = match &args.unix_socket {
        Some(path) => path.clone(),
        None => workdir
            .path()
            .join("gdb.sock")
            .to_string_lossy()
            .into_owned(),
    };

    let mut writer = TraceWriter::new(vec![
        Box::new(RegisterSetProbe) as Box<dyn Probe>,
        Box::new(MemoryProbe::new(
            "rom",
            rom_base,
            rom_image.len() as u32,
            true,
        )),
        Box::new(MemoryProbe::new("ram", ram_base, ram_size, false)),
    ]);
    let options = CaptureOptions {
        decimation: args.decimation,
        max_insn_count: args.max_insn_cnt,
    };

    // Listen first, then fork the emulator against the socket, then accept its
    // connection.
    let listener = UnixListener::bind(&socket_path)?;
    let mut child = spawn_emulator(args, &socket_path, &rom_file.to_string_lossy())?;
    let capture = (|| {
        let (conn, _) = listener.accept()?;
        let mut target = RemoteTarget::new(Stream::Unix(conn))?;
        let reason = writer.run(&mut target, &options)?;
        info!("stop reason: {:?}", reason);
        let _ = target.kill_request();
        target.close();
        Ok::<_, calvados::gdb::TargetError>(())
    })();
    if let Some(child) = child.as_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
    capture?;

    let file = writer.finish(
        rom_base,
        ram_base,
        ram_size,
        match args.emulator {
            Emulator::Qemu => "qemu",
            _ => "t2sim",
        },
        rom_image,
    );
    file.write_file(&args.trc_filename)?;
    info!("wrote {}", args.trc_filename);
    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .init();
    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
