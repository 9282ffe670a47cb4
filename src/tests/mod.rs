//! End-to-end scenario tests driving a real [`crate::engine::Engine`]
//! with synthetic file/job kinds (no real compiler is invoked — see
//! `DESIGN.md`). Each test builds its own throwaway `src`/`out` tree
//! with `tempfile` and controls mtimes with `filetime`.

mod fixtures;
