//! # tracehook - Runtime Instrumentation Engine
//!
//! tracehook observes selected operations of running processes (file access
//! checks, file opens, signal delivery), logs the ones its process filter
//! selects together with the caller's user stack, manages a small pool of
//! hardware breakpoints, and reads memory from other processes on demand.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Host                                   │
//! │  interception  •  trap delivery  •  process & memory services   │
//! └───────┬──────────────────────┬──────────────────────┬───────────┘
//!         │ observed calls       │ trap hits            │ capabilities
//!         ▼                      ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      tracehook::Engine                          │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Syscall    │──▶│    Stack     │──▶│    Module    │         │
//! │  │   Observer   │   │   Unwinder   │   │   Resolver   │         │
//! │  └──────┬───────┘   └──────────────┘   └──────────────┘         │
//! │         ▼                                                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Process    │   │  Hardware    │   │    Remote    │         │
//! │  │   Filter     │   │ Breakpoints  │   │ Memory Reader│         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ text commands
//!                                 ▼
//!                      control::dispatch  ◀── tracehook CLI
//! ```
//!
//! ## Module Structure
//!
//! - [`engine`]: the components and the [`engine::Engine`] that wires them
//!   - `observer`: the three syscall handlers
//!   - `filter`: whitelist/blacklist decision
//!   - `unwinder`: compat frame-pointer walker and trace rendering
//!   - `module_resolver`: `module + offset` labels from mapping tables
//!   - `breakpoints` / `relocation`: four trap slots and the relocate-on-hit protocol
//!   - `memory_reader`: raw and hex reads of another process
//!
//! - [`control`]: text command parsing and dispatch
//!
//! - [`config`]: startup settings and the live shared configuration
//!
//! - [`host`]: host facility traits and backends
//!   - `linux`: `/proc`, `process_vm_readv`, `perf_event_open`
//!   - `layout`: raw kernel-structure walker driven by a layout table
//!   - `sim`: scriptable host with fault injection
//!
//! - [`domain`]: newtypes and errors
//!
//! - [`cli`]: command-line argument parsing
//!
//! ## Relocate-on-Hit
//!
//! An execution trap left in place fires again as soon as the task resumes.
//! On the first hit the trap moves to the next instruction; the hit there moves
//! it back. Only hits at the original address are counted. A host that cannot
//! move traps in place gets one-shot breakpoints instead.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Try the control surface against the simulated host
//! tracehook --simulate get_status add_filter:name:app get_status
//!
//! # Watch an instruction in a live process for 30 seconds
//! sudo tracehook --watch 30 bp_set:0x7f001000:exec:4:1234
//! ```

pub mod cli;
pub mod config;
pub mod control;
pub mod domain;
pub mod engine;
pub mod host;
