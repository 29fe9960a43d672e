//! Silicon model for the DPU inference accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the device: control register offsets, the exec-write command
//! packet, and the fixed geometry of the hardware tensor layout.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Control register map: AP control, buffer address blocks, task parameters, diagnostics |
//! | [`ert`] | Exec-write command packet: header bit fields, opcodes, command states |
//! | [`geometry`] | Channel parallelism, burst word size, output segment geometry, dmem base addresses |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ert;
pub mod geometry;
pub mod regs;
