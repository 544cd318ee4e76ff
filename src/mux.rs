//! Multiplexer sequencing.
//!
//! Before a pin can serve a requested peripheral function, its mapping's
//! mux chain is walked in order, driving each auxiliary GPIO to an
//! absolute state. Auxiliary pins are plain raw lines; chains never
//! nest. A failing step aborts the rest of the chain and reports the
//! step index — the pin is then in an indeterminate mux state and the
//! only supported recovery is re-running the whole sequence.

use std::sync::Arc;

use crate::board::{Board, MuxCmd, MuxStep, PinMapping};
use crate::error::{Error, Result};
use crate::gpio::{Direction, Gpio, Level, Mode};
use crate::tracing::prelude::*;

/// Apply every mux step of `mapping`, in order.
///
/// Steps set absolute values, so applying the same mapping twice leaves
/// the auxiliary pins in the same state as applying it once. No file
/// handles stay open past the call.
pub(crate) fn apply(board: &Arc<Board>, mapping: &PinMapping) -> Result<()> {
    for (step_idx, step) in mapping.mux.iter().enumerate() {
        apply_step(board, step_idx, step).map_err(|e| {
            if matches!(e, Error::Mux { .. } | Error::MuxNotOutput { .. }) {
                e
            } else {
                Error::Mux {
                    step: step_idx,
                    source: Box::new(e),
                }
            }
        })?;
    }
    Ok(())
}

fn apply_step(board: &Arc<Board>, step_idx: usize, step: &MuxStep) -> Result<()> {
    if step.cmd == MuxCmd::Skip {
        return Ok(());
    }

    trace!(step = step_idx, pin = step.pin, cmd = ?step.cmd, value = step.value, "mux step");

    let mut aux = Gpio::open_raw_on_board(board, step.pin)?;
    // The auxiliary line belongs to the board wiring, not to us.
    aux.set_owner(false)?;

    let outcome = match step.cmd {
        MuxCmd::SetValue => {
            if aux.dir()? != Direction::Out {
                Err(Error::MuxNotOutput {
                    step: step_idx,
                    pin: step.pin,
                })
            } else {
                aux.write(Level::from(step.value != 0))
            }
        }
        MuxCmd::SetDirection => {
            let dir = Direction::from_mux_value(step.value).ok_or_else(|| {
                Error::InvalidParameter(format!("mux direction value {} unknown", step.value))
            })?;
            aux.set_dir(dir)
        }
        // Direction first, value second: an output's level is undefined
        // until its direction is set.
        MuxCmd::SetInValue => aux
            .set_dir(Direction::In)
            .and_then(|()| aux.write(Level::from(step.value != 0))),
        MuxCmd::SetOutValue => aux
            .set_dir(Direction::Out)
            .and_then(|()| aux.write(Level::from(step.value != 0))),
        MuxCmd::SetMode => {
            let mode = Mode::from_mux_value(step.value).ok_or_else(|| {
                Error::InvalidParameter(format!("mux mode value {} unknown", step.value))
            })?;
            aux.set_mode(mode)
        }
        MuxCmd::Skip => Ok(()),
    };

    match outcome {
        Ok(()) => aux.close(),
        Err(e) => {
            let _ = aux.close();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Platform;
    use crate::gpio::tests::{fake_sysfs, sysfs_board};
    use std::fs;

    fn board_with_mux(root: &std::path::Path, mux: Vec<MuxStep>) -> Platform {
        let mut board = sysfs_board(root, &[4, 20, 21]);
        board.pins[0].gpio.as_mut().unwrap().mux = mux;
        Platform::new(board)
    }

    fn value_of(root: &std::path::Path, line: u32) -> String {
        fs::read_to_string(root.join(format!("gpio{line}")).join("value")).unwrap()
    }

    #[test]
    fn test_chain_applies_in_order_and_is_idempotent() {
        let root = fake_sysfs(&[4, 20, 21]);
        let platform = board_with_mux(
            root.path(),
            vec![
                MuxStep {
                    pin: 20,
                    cmd: MuxCmd::SetOutValue,
                    value: 0,
                },
                MuxStep {
                    pin: 21,
                    cmd: MuxCmd::SetOutValue,
                    value: 1,
                },
                MuxStep {
                    pin: 0,
                    cmd: MuxCmd::Skip,
                    value: 0,
                },
            ],
        );

        let gpio = platform.gpio(0).unwrap();
        assert_eq!(value_of(root.path(), 20), "0");
        assert_eq!(value_of(root.path(), 21), "1");
        gpio.close().unwrap();

        // Re-running the whole chain lands in the same state.
        let gpio = platform.gpio(0).unwrap();
        assert_eq!(value_of(root.path(), 20), "0");
        assert_eq!(value_of(root.path(), 21), "1");
        gpio.close().unwrap();
    }

    #[test]
    fn test_set_value_on_input_line_is_not_output_error() {
        let root = fake_sysfs(&[4, 20, 21]);
        // Line 20 stays an input; SetValue on it is a board-definition
        // error.
        let platform = board_with_mux(
            root.path(),
            vec![MuxStep {
                pin: 20,
                cmd: MuxCmd::SetValue,
                value: 1,
            }],
        );
        let err = platform.gpio(0).unwrap_err();
        assert!(matches!(
            err,
            Error::MuxNotOutput { step: 0, pin: 20 }
        ));
    }

    #[test]
    fn test_failing_step_reports_index_and_aborts_chain() {
        let root = fake_sysfs(&[4, 20]);
        // Step 1 targets a line with no sysfs entry.
        let platform = board_with_mux(
            root.path(),
            vec![
                MuxStep {
                    pin: 20,
                    cmd: MuxCmd::SetOutValue,
                    value: 1,
                },
                MuxStep {
                    pin: 99,
                    cmd: MuxCmd::SetOutValue,
                    value: 1,
                },
            ],
        );
        let err = platform.gpio(0).unwrap_err();
        match err {
            Error::Mux { step, .. } => assert_eq!(step, 1),
            other => panic!("expected mux error, got {other:?}"),
        }
        // Step 0 ran before the abort.
        assert_eq!(value_of(root.path(), 20), "1");
    }

    #[test]
    fn test_mux_aux_pins_are_never_owned() {
        let root = fake_sysfs(&[4, 20]);
        let platform = board_with_mux(
            root.path(),
            vec![MuxStep {
                pin: 20,
                cmd: MuxCmd::SetOutValue,
                value: 1,
            }],
        );
        platform.gpio(0).unwrap().close().unwrap();
        // Only the context's own line 4 was ever unexported.
        assert_eq!(
            fs::read_to_string(root.path().join("unexport")).unwrap(),
            "4"
        );
    }
}
