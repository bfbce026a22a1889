use std::process;

use log::info;
use mems::{AddressSpace, PAGE_SIZE, VirtualAddress};

/// Translates and prints where a simulated address really lives.
fn print_translation<B: mems::BackingStore>(
  space: &AddressSpace<B>,
  label: &str,
  address: VirtualAddress,
) -> mems::Result<()> {
  let physical = space.get(address)?;
  println!("[{}] virtual {} -> physical {:?}", label, address, physical);
  Ok(())
}

fn run() -> mems::Result<()> {
  let mut space = AddressSpace::new();

  // --------------------------------------------------------------------
  // 1) A handful of small allocations share the first page.
  // --------------------------------------------------------------------
  let mut small = Vec::new();
  for i in 0..10 {
    let address = space.malloc(100)?;
    println!("[1] malloc(100) #{} = {}", i, address);
    small.push(address);
  }
  space.print_stats();

  // --------------------------------------------------------------------
  // 2) Something larger than a page gets its own rounded-up chunk.
  // --------------------------------------------------------------------
  let large = space.malloc(PAGE_SIZE + 1)?;
  println!("\n[2] malloc({}) = {}", PAGE_SIZE + 1, large);
  print_translation(&space, "2", large)?;

  // Write through the translation to show the memory is real.
  unsafe {
    let physical = space.get(large)?.as_ptr();
    physical.write_bytes(0xAB, PAGE_SIZE + 1);
    println!("[2] last byte = 0x{:X}", *space.get(large + PAGE_SIZE)?.as_ptr());
  }
  space.print_stats();

  // --------------------------------------------------------------------
  // 3) Free a few neighbours and watch the holes merge.
  // --------------------------------------------------------------------
  space.free(small[3])?;
  space.free(small[5])?;
  space.free(small[4])?;
  println!("\n[3] freed {}, {} and {}", small[3], small[5], small[4]);
  space.print_stats();

  // --------------------------------------------------------------------
  // 4) The merged hole is reused before the space grows.
  // --------------------------------------------------------------------
  let reused = space.malloc(250)?;
  println!(
    "\n[4] malloc(250) = {} (reused freed hole: {})",
    reused,
    if reused == small[3] { "yes" } else { "no" }
  );
  space.print_stats();

  // --------------------------------------------------------------------
  // 5) Caller mistakes are reported without touching the state.
  // --------------------------------------------------------------------
  if let Err(e) = space.free(small[0] + 1) {
    println!("\n[5] free({}) rejected: {}", small[0] + 1, e);
  }
  if let Err(e) = space.get(VirtualAddress::new(0)) {
    println!("[5] get(0) rejected: {}", e);
  }

  // --------------------------------------------------------------------
  // 6) Teardown unmaps everything.
  // --------------------------------------------------------------------
  space.finish()?;
  println!("\n[6] after finish");
  space.print_stats();

  Ok(())
}

fn main() {
  pretty_env_logger::init();

  if let Err(e) = run() {
    eprintln!("mems: {}", e);
    process::exit(if e.is_fatal() { 2 } else { 1 });
  }

  info!("walkthrough finished");
}
