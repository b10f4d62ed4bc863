//! MaskFE: raster image editing core: layered documents, rectangular
//! selections, layer masks and crop, all driven through an undoable command
//! history.
//!
//! [`project::Project`] is the entry point for hosts; it owns the
//! [`document::Document`], its [`components::history::HistoryManager`] and the
//! pointer-driven [`components::tools::SelectionController`].

#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

#[macro_use]
pub mod logger;

pub mod canvas;
pub mod cli;
pub mod components;
pub mod document;
pub mod error;
pub mod geometry;
pub mod io;
pub mod ops;
pub mod project;
pub mod settings;
