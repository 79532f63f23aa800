use crate::error::Error;
use crate::wire::PayloadReader;

/// Assembly as seen from a particular app-domain. The primary [`super::Assembly`]
/// is shared, the instance refers to it by index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AssemblyInstance {
    pub idx: u32,
    pub app_domain: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppDomain {
    pub id: u32,
    pub name: String,
    pub state: u32,
    pub assemblies: Vec<AssemblyInstance>,
}

impl AppDomain {
    /// Parse `RESOLVE_APP_DOMAIN` reply.
    pub(crate) fn read(id: u32, reader: &mut PayloadReader) -> Result<Self, Error> {
        let state = reader.u32()?;
        let name = reader.string()?;
        let assemblies = reader
            .list(|r| r.u32())?
            .into_iter()
            .map(|idx| AssemblyInstance { idx, app_domain: id })
            .collect();
        Ok(AppDomain {
            id,
            name,
            state,
            assemblies,
        })
    }

    pub fn contains(&self, assembly_idx: u32) -> bool {
        self.assemblies.iter().any(|a| a.idx == assembly_idx)
    }

    pub fn instance(&self, assembly_idx: u32) -> Option<AssemblyInstance> {
        self.assemblies
            .iter()
            .find(|a| a.idx == assembly_idx)
            .copied()
    }
}
