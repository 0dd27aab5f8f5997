use std::io::Read;

use clap::{Parser, ValueEnum};
use compalloc::{CompactingAllocator, Config, DEFAULT_CAPACITY, Error, Region};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
  /// mmap reservation of `--capacity` bytes.
  Reserved,
  /// Process program break (sbrk). Fails with "break moved" as soon as
  /// anything else in the process grows the heap.
  Brk,
}

/// Allocates two integers and a string, frees the first integer and reads
/// the rest back after compaction.
#[derive(Parser, Debug)]
#[command(name = "scenario")]
struct Cli {
  #[arg(long, value_enum, default_value = "reserved", env = "COMPALLOC_BACKEND")]
  backend: Backend,

  /// Bytes reserved by the `reserved` backend.
  #[arg(long, default_value_t = DEFAULT_CAPACITY, env = "COMPALLOC_CAPACITY")]
  capacity: usize,

  /// Round payloads up to the machine word.
  #[arg(long)]
  word_align: bool,

  /// Wait for ENTER between steps, to inspect the process with `pmap` or `gdb`.
  #[arg(long)]
  pause: bool,

  /// Log filter (trace, debug, info, ...).
  #[arg(long, default_value = "info", env = "RUST_LOG")]
  log_level: String,
}

/// Waits until the user presses ENTER.
fn block_until_enter_pressed(pause: bool) {
  if pause {
    println!("\n>>> Press ENTER to continue...");
    let _ = std::io::stdin().bytes().next();
  }
}

fn print_region<R: Region>(
  label: &str,
  allocator: &CompactingAllocator<R>,
) {
  println!(
    "[{}] blocks = {}, region = {} bytes, top = {:?}",
    label,
    allocator.len(),
    allocator.region_len(),
    allocator.region().current_top(),
  );
}

fn read_i32<R: Region>(
  allocator: &CompactingAllocator<R>,
  id: compalloc::BlockId,
) -> compalloc::Result<i32> {
  let bytes = allocator.lookup(id)?;
  let bytes: [u8; 4] = bytes
    .try_into()
    .map_err(|_| Error::Corrupted(format!("block {id} is not 4 bytes long")))?;
  Ok(i32::from_ne_bytes(bytes))
}

fn run<R: Region>(
  allocator: &mut CompactingAllocator<R>,
  pause: bool,
) -> compalloc::Result<()> {
  print_region("start", allocator);
  block_until_enter_pressed(pause);

  let first = allocator.allocate(4)?;
  allocator.lookup_mut(first)?.copy_from_slice(&1i32.to_ne_bytes());
  println!("\n[1] Allocated i32 as {first}");
  print_region("1", allocator);

  let second = allocator.allocate(4)?;
  allocator.lookup_mut(second)?.copy_from_slice(&10000i32.to_ne_bytes());
  println!("\n[2] Allocated i32 as {second}");
  print_region("2", allocator);

  let text = allocator.allocate(12)?;
  allocator.lookup_mut(text)?.copy_from_slice(b"HELLO WORLD\0");
  println!("\n[3] Allocated string as {text}");
  print_region("3", allocator);
  block_until_enter_pressed(pause);

  println!("\n[4] {first} = {}", read_i32(allocator, first)?);
  println!("[4] {text} = {:?}", String::from_utf8_lossy(allocator.lookup(text)?));

  allocator.free(first)?;
  println!("\n[5] Freed {first}");
  print_region("5", allocator);
  block_until_enter_pressed(pause);

  println!("\n[6] {second} = {}", read_i32(allocator, second)?);
  println!("[6] {text} = {:?}", String::from_utf8_lossy(allocator.lookup(text)?));

  match allocator.lookup(first) {
    Err(error) => println!("[6] {first}: {error}"),
    Ok(_) => return Err(Error::Corrupted(format!("{first} survived its free"))),
  }

  allocator.check()?;
  info!("region consistent after compaction");

  Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_new(&cli.log_level)?)
    .init();

  let config = Config::default()
    .word_align(cli.word_align)
    .capacity(cli.capacity);

  info!(backend = ?cli.backend, ?config, "starting");

  match cli.backend {
    Backend::Reserved => run(&mut CompactingAllocator::reserved(config), cli.pause)?,
    Backend::Brk => run(&mut CompactingAllocator::brk(config), cli.pause)?,
  }

  Ok(())
}
