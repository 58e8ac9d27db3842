//! Loading, classifying and attaching whole collections.

use std::collections::BTreeMap;

use log::{debug, warn};
use thiserror::Error;

use crate::{
    bypass::{setup_bypass, BypassError, BYPASS_MAP_NAME},
    maps::{Map, MapError},
    obj::{
        relocation::{self, RelocationError},
        AttachType, CollectionSpec, ProgramSpec, ProgramType,
    },
    programs::{
        load_program, Kprobe, KprobeOptions, LinkSet, Program, ProgramError, SocketFilter,
        Tracepoint, Tracing, Uprobe, UprobeOptions,
    },
};

/// Options for [`Collection::load`].
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Rewrite programs that opt in to runtime bypassing. When disabled the
    /// sentinel map and references are left alone and pause/resume are
    /// no-ops.
    pub bypass_enabled: bool,
    /// Request verifier logs even for programs that load successfully; they
    /// are emitted at debug level.
    pub verifier_logs: bool,
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("setup bypass: {0}")]
    Bypass(#[from] BypassError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Relocation(#[from] RelocationError),

    #[error("load collection: {0}")]
    Program(#[from] ProgramError),

    /// A kprobe-type program has a section name outside the four known
    /// probe prefixes.
    #[error("unknown kprobe section prefix `{section}` for program `{program}`")]
    UnknownSectionPrefix { program: String, section: String },

    /// The spec contains a program kind the collection cannot attach.
    #[error("unsupported program type {ty:?} for program `{program}`")]
    UnsupportedProgramType { program: String, ty: ProgramType },

    /// A tracepoint section name is not of the form
    /// `tracepoint/<group>/<name>`.
    #[error("invalid tracepoint section `{section}` for program `{program}`")]
    InvalidTracepointSection { program: String, section: String },

    /// A tracing program spec carries no attach type.
    #[error("tracing program `{program}` has no attach type")]
    MissingAttachType { program: String },
}

/// The error type returned when attaching a collection fails. Every variant
/// names the failing program and its target; links created earlier in the
/// same call have already been closed again when this surfaces.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("attach kprobe `{program}` to `{target}`")]
    Kprobe {
        program: String,
        target: String,
        #[source]
        source: ProgramError,
    },

    #[error("attach uprobe `{program}` to `{target}`")]
    Uprobe {
        program: String,
        target: String,
        #[source]
        source: ProgramError,
    },

    #[error("attach tracepoint `{program}` to `{group}/{name}`")]
    Tracepoint {
        program: String,
        group: String,
        name: String,
        #[source]
        source: ProgramError,
    },

    #[error("attach socket filter `{program}` to fd {fd}")]
    SocketFilter {
        program: String,
        fd: i32,
        #[source]
        source: ProgramError,
    },

    #[error("attach tracing program `{program}` ({attach_type})")]
    Tracing {
        program: String,
        attach_type: AttachType,
        #[source]
        source: ProgramError,
    },
}

/// A loaded collection: kernel handles for every map and program in the
/// spec, classified by attach kind.
///
/// Dropping (or [`close`](Collection::close)-ing) the collection releases
/// every program and map file descriptor.
#[derive(Debug, Default)]
pub struct Collection {
    maps: BTreeMap<String, Map>,
    pub kprobes: BTreeMap<String, Kprobe>,
    pub uprobes: BTreeMap<String, Uprobe>,
    pub tracepoints: BTreeMap<String, Tracepoint>,
    pub socket_filters: BTreeMap<String, SocketFilter>,
    pub tracing: BTreeMap<String, Tracing>,
}

impl Collection {
    /// Loads `spec` into the kernel.
    ///
    /// When bypassing is enabled, opted-in programs are rewritten before
    /// anything is loaded. Maps are created first so instruction map
    /// references can be patched with their file descriptors, then each
    /// program is loaded and classified by its kind and section name.
    pub fn load(
        mut spec: CollectionSpec,
        options: CollectionOptions,
    ) -> Result<Collection, CollectionError> {
        let bypass_indexes = if options.bypass_enabled {
            setup_bypass(&mut spec)?
        } else {
            BTreeMap::new()
        };
        if bypass_indexes.is_empty() {
            spec.maps.remove(BYPASS_MAP_NAME);
        }

        let mut collection = Collection::default();
        for (name, map_spec) in &spec.maps {
            let map = Map::create(name, map_spec)?;
            debug!("created map `{}` (fd {})", name, map.fd());
            collection.maps.insert(name.clone(), map);
        }

        for (name, program_spec) in &spec.programs {
            let instructions =
                relocation::encode_and_relocate(name, &program_spec.instructions, &collection.maps)?;
            let program = load_program(name, program_spec, &instructions, options.verifier_logs)?;
            let bypass_index = bypass_indexes.get(name).copied().unwrap_or(0);
            collection.classify(name, program_spec, program, bypass_index)?;
        }

        Ok(collection)
    }

    fn classify(
        &mut self,
        name: &str,
        spec: &ProgramSpec,
        program: Program,
        bypass_index: u32,
    ) -> Result<(), CollectionError> {
        match spec.ty {
            ProgramType::Kprobe => {
                let section = spec.section_name.as_str();
                if let Some(target) = section.strip_prefix("kprobe/") {
                    self.insert_kprobe(name, program, target, false, bypass_index);
                } else if let Some(target) = section.strip_prefix("kretprobe/") {
                    self.insert_kprobe(name, program, target, true, bypass_index);
                } else if let Some(target) = section.strip_prefix("uprobe/") {
                    self.insert_uprobe(name, program, target, false, bypass_index);
                } else if let Some(target) = section.strip_prefix("uretprobe/") {
                    self.insert_uprobe(name, program, target, true, bypass_index);
                } else {
                    return Err(CollectionError::UnknownSectionPrefix {
                        program: name.to_owned(),
                        section: section.to_owned(),
                    });
                }
            }
            ProgramType::TracePoint => {
                let (group, event) = spec
                    .section_name
                    .strip_prefix("tracepoint/")
                    .and_then(|rest| rest.split_once('/'))
                    .ok_or_else(|| CollectionError::InvalidTracepointSection {
                        program: name.to_owned(),
                        section: spec.section_name.clone(),
                    })?;
                self.tracepoints.insert(
                    name.to_owned(),
                    Tracepoint {
                        program,
                        group: group.to_owned(),
                        name: event.to_owned(),
                    },
                );
            }
            ProgramType::SocketFilter => {
                self.socket_filters.insert(
                    name.to_owned(),
                    SocketFilter {
                        program,
                        socket_fd: None,
                    },
                );
            }
            ProgramType::Tracing => {
                let attach_type =
                    spec.attach_type
                        .ok_or_else(|| CollectionError::MissingAttachType {
                            program: name.to_owned(),
                        })?;
                self.tracing.insert(
                    name.to_owned(),
                    Tracing {
                        program,
                        attach_type,
                    },
                );
            }
            ty => {
                return Err(CollectionError::UnsupportedProgramType {
                    program: name.to_owned(),
                    ty,
                });
            }
        }
        Ok(())
    }

    fn insert_kprobe(
        &mut self,
        name: &str,
        program: Program,
        target: &str,
        retprobe: bool,
        bypass_index: u32,
    ) {
        self.kprobes.insert(
            name.to_owned(),
            Kprobe {
                program,
                attach_to: target.to_owned(),
                retprobe,
                options: KprobeOptions::default(),
                bypass_index,
            },
        );
    }

    fn insert_uprobe(
        &mut self,
        name: &str,
        program: Program,
        target: &str,
        retprobe: bool,
        bypass_index: u32,
    ) {
        self.uprobes.insert(
            name.to_owned(),
            Uprobe {
                program,
                binary_path: None,
                attach_to: target.to_owned(),
                retprobe,
                options: UprobeOptions::default(),
                bypass_index,
            },
        );
    }

    /// The created map with the given spec name, if any.
    pub fn map(&self, name: &str) -> Option<&Map> {
        self.maps.get(name)
    }

    /// Attaches every program in the collection to its kernel hook.
    ///
    /// All-or-nothing: on the first attach failure the links created so far
    /// are closed again, most recent first, and the error is returned.
    pub fn attach(&self) -> Result<LinkSet, AttachError> {
        let mut links = LinkSet::new();

        for (name, kprobe) in &self.kprobes {
            match kprobe.attach() {
                Ok(link) => links.push(Box::new(link)),
                Err(source) => {
                    return Err(rollback(
                        links,
                        AttachError::Kprobe {
                            program: name.clone(),
                            target: kprobe.attach_to().to_owned(),
                            source,
                        },
                    ));
                }
            }
        }

        for (name, uprobe) in &self.uprobes {
            match uprobe.attach() {
                Ok(link) => links.push(Box::new(link)),
                Err(source) => {
                    return Err(rollback(
                        links,
                        AttachError::Uprobe {
                            program: name.clone(),
                            target: uprobe.attach_to().to_owned(),
                            source,
                        },
                    ));
                }
            }
        }

        for (name, tracepoint) in &self.tracepoints {
            match tracepoint.attach() {
                Ok(link) => links.push(Box::new(link)),
                Err(source) => {
                    return Err(rollback(
                        links,
                        AttachError::Tracepoint {
                            program: name.clone(),
                            group: tracepoint.group().to_owned(),
                            name: tracepoint.name().to_owned(),
                            source,
                        },
                    ));
                }
            }
        }

        for (name, socket_filter) in &self.socket_filters {
            match socket_filter.attach() {
                Ok(link) => links.push(Box::new(link)),
                Err(source) => {
                    return Err(rollback(
                        links,
                        AttachError::SocketFilter {
                            program: name.clone(),
                            fd: socket_filter.socket_fd.unwrap_or(-1),
                            source,
                        },
                    ));
                }
            }
        }

        for (name, tracing) in &self.tracing {
            match tracing.attach() {
                Ok(link) => links.push(Box::new(link)),
                Err(source) => {
                    return Err(rollback(
                        links,
                        AttachError::Tracing {
                            program: name.clone(),
                            attach_type: tracing.attach_type(),
                            source,
                        },
                    ));
                }
            }
        }

        debug!("attached {} links", links.len());
        Ok(links)
    }

    /// Bypasses every rewritten kprobe and uprobe. Programs stay attached;
    /// their kernel-side gate makes them return immediately.
    pub fn pause(&self) -> Result<(), BypassError> {
        let bypass_map = self.maps.get(BYPASS_MAP_NAME);
        for kprobe in self.kprobes.values() {
            kprobe.pause(bypass_map)?;
        }
        for uprobe in self.uprobes.values() {
            uprobe.pause(bypass_map)?;
        }
        Ok(())
    }

    /// Re-enables every rewritten kprobe and uprobe.
    pub fn resume(&self) -> Result<(), BypassError> {
        let bypass_map = self.maps.get(BYPASS_MAP_NAME);
        for kprobe in self.kprobes.values() {
            kprobe.resume(bypass_map)?;
        }
        for uprobe in self.uprobes.values() {
            uprobe.resume(bypass_map)?;
        }
        Ok(())
    }

    /// Releases every program and map in the collection. Attachments held
    /// by outstanding [`LinkSet`]s survive until those are closed.
    pub fn close(self) {}
}

// Closing happens in LinkSet::drop, most recently attached first.
fn rollback(links: LinkSet, error: AttachError) -> AttachError {
    if !links.is_empty() {
        warn!(
            "attach failed, closing {} previously attached links: {}",
            links.len(),
            error
        );
    }
    drop(links);
    error
}
