// Entry point for the etvm-host console process.
//
//   1. Parse command line arguments (`+set` and `+command` forms)
//   2. Initialize cvars, commands, filesystem and the module registry
//   3. Read console lines from stdin until `quit` or end of input

use std::io;

use etvm_common::common::{DISTNAME, DISTVER};
use etvm_sys::sys_main::Host;
use etvm_vm::NativeLoader;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() == 2 && (args[1] == "--version" || args[1] == "-v") {
        println!("{} {}", DISTNAME, DISTVER);
        return;
    }

    let mut host = Host::new(Box::new(NativeLoader::new()));
    host.init(&args);

    let stdin = io::stdin();
    host.run(stdin.lock());

    host.shutdown();
}
