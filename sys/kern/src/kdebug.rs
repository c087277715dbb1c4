// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel debug interface.
//!
//! A task with console access can poke the kernel with short text
//! commands; the output lands in the kernel log where `ReadLog` picks it
//! up. This is a diagnostic side door, not an API -- commands are
//! deliberately few.

use abi::Error;
use core::fmt::Write;

use crate::startup::Kernel;

/// Runs one debug command.
pub fn run(k: &mut Kernel, cmd: &str) -> Result<i64, Error> {
    match cmd.trim() {
        "" => Ok(0),
        "help" => {
            let _ = writeln!(k.klog, "kdebug commands: help, ps, q");
            Ok(0)
        }
        "ps" => {
            dump_tasks(k);
            Ok(0)
        }
        "q" => crate::arch::reset(),
        _ => Err(Error::InvalidArg),
    }
}

fn dump_tasks(k: &mut Kernel) {
    let Kernel { tasks, klog, .. } = k;
    for i in tasks.live_tasks() {
        let task = tasks.task(i);
        let _ = writeln!(
            klog,
            "#{} {}: state={:?}, src={:?}, notif={:?}",
            task.tid().0,
            task.name(),
            task.state(),
            task.src(),
            task.notifications(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_reports_live_tasks() {
        let mut k = Box::new(Kernel::new());
        k.tasks
            .create(0, b"root", 0, None, abi::TaskFlags::empty())
            .unwrap();
        assert_eq!(run(&mut k, "ps"), Ok(0));
        let mut out = [0u8; 256];
        let n = k.klog.read(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert!(text.contains("#1 root"));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let mut k = Box::new(Kernel::new());
        assert_eq!(run(&mut k, "reboot --force"), Err(Error::InvalidArg));
        assert_eq!(run(&mut k, ""), Ok(0));
        assert_eq!(run(&mut k, "help"), Ok(0));
    }
}
