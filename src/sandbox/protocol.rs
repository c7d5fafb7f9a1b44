// src/sandbox/protocol.rs

//! Command scripts understood by the MDB and SIM30 simulators.

use std::path::Path;

/// Echoed by MDB once a run script has been fully processed.
pub const FINISHED_MARKER: &str = ">/*Simulation finished.*/";

/// Selects the device and routes UART1 to a file. Sent once per session and
/// again whenever the device changes.
pub fn setup_commands(mcu: &str) -> String {
    format!(
        "device {}\n\
         set uart1io.uartioenabled true\n\
         set uart1io.output file\n\
         set oscillator.frequency 1\n\
         set oscillator.frequencyunit Mega\n",
        mcu
    )
}

/// Loads `elf`, runs it until `_done` (or 12 s of simulated wall time) and
/// echoes [`FINISHED_MARKER`].
pub fn run_commands(elf: &Path, uart_out: &Path) -> String {
    format!(
        "set uart1io.outputfile {}\n\
         hwtool sim\n\
         program \"{}\"\n\
         break _done\n\
         run\n\
         wait 12000\n\
         halt\n\
         delete\n\
         echo Simulation finished.\n",
        posix(uart_out),
        posix(elf)
    )
}

/// One-shot SIM30 script. SIM30 cannot cope with spaces in file names.
pub fn sim30_script(mcu: &str, elf: &Path, uart_out: &Path) -> Result<String, String> {
    let elf = posix(elf);
    if elf.contains(' ') {
        return Err(format!(
            "sim30 does not support spaces in file names, which occurs in {}.",
            elf
        ));
    }

    Ok(format!(
        "LD {}\n\
         LC {}\n\
         IO nul {}\n\
         RP\n\
         BS _done\n\
         E 10000\n\
         Q\n",
        mcu,
        elf,
        posix(uart_out)
    ))
}

fn posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_commands_order() {
        let script = run_commands(Path::new("/tmp/a.elf"), Path::new("/tmp/out.txt"));
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "set uart1io.outputfile /tmp/out.txt");
        assert_eq!(lines[2], "program \"/tmp/a.elf\"");
        assert_eq!(lines.last(), Some(&"echo Simulation finished."));
    }

    #[test]
    fn test_setup_selects_device() {
        assert!(setup_commands("dspic33EP128GP502").starts_with("device dspic33EP128GP502\n"));
    }

    #[test]
    fn test_sim30_rejects_spaces() {
        assert!(sim30_script("dspic33epsuper", Path::new("/tmp/my file.elf"), Path::new("/tmp/o")).is_err());
        let script = sim30_script("dspic33epsuper", Path::new("/tmp/a.elf"), Path::new("/tmp/o")).unwrap();
        assert!(script.starts_with("LD dspic33epsuper\nLC /tmp/a.elf\n"));
    }
}
