/// Shader stage ids as packed into the top five bits of header word 2.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex = 0,
    TessellationControl = 1,
    TessellationEvaluation = 2,
    Geometry = 3,
    Fragment = 4,
    Compute = 5,
    RayGeneration = 6,
    AnyHit = 7,
    ClosestHit = 8,
    Miss = 9,
    Intersection = 10,
    Callable = 11,
    Task = 12,
    Mesh = 13,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 14] = [
        ShaderStage::Vertex,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEvaluation,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
        ShaderStage::Compute,
        ShaderStage::RayGeneration,
        ShaderStage::AnyHit,
        ShaderStage::ClosestHit,
        ShaderStage::Miss,
        ShaderStage::Intersection,
        ShaderStage::Callable,
        ShaderStage::Task,
        ShaderStage::Mesh,
    ];

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "Vertex",
            ShaderStage::TessellationControl => "Tessellation Control",
            ShaderStage::TessellationEvaluation => "Tessellation Eval",
            ShaderStage::Geometry => "Geometry",
            ShaderStage::Fragment => "Fragment",
            ShaderStage::Compute => "Compute",
            ShaderStage::RayGeneration => "Ray Generation",
            ShaderStage::AnyHit => "Any Hit",
            ShaderStage::ClosestHit => "Closest Hit",
            ShaderStage::Miss => "Miss",
            ShaderStage::Intersection => "Intersection",
            ShaderStage::Callable => "Callable",
            ShaderStage::Task => "Task",
            ShaderStage::Mesh => "Mesh",
        }
    }

    pub fn is_ray_tracing(self) -> bool {
        matches!(
            self,
            ShaderStage::RayGeneration
                | ShaderStage::AnyHit
                | ShaderStage::ClosestHit
                | ShaderStage::Miss
                | ShaderStage::Intersection
                | ShaderStage::Callable
        )
    }

    /// Render the three stage-disambiguating words for a diagnostic.
    pub fn describe(self, info: [u32; 3]) -> String {
        let detail = match self {
            ShaderStage::Vertex => {
                format!("Vertex Index {}, Instance Index {}", info[0], info[1])
            }
            ShaderStage::TessellationControl => {
                format!("Invocation ID {}, Primitive ID {}", info[0], info[1])
            }
            ShaderStage::TessellationEvaluation => format!(
                "Primitive ID {}, TessCoord (u, v) = ({}, {})",
                info[0],
                f32::from_bits(info[1]),
                f32::from_bits(info[2])
            ),
            ShaderStage::Geometry => {
                format!("Primitive ID {}, Invocation ID {}", info[0], info[1])
            }
            ShaderStage::Fragment => format!(
                "Fragment coord (x, y) = ({}, {})",
                f32::from_bits(info[0]),
                f32::from_bits(info[1])
            ),
            ShaderStage::Compute | ShaderStage::Task | ShaderStage::Mesh => format!(
                "Global invocation ID (x, y, z) = ({}, {}, {})",
                info[0], info[1], info[2]
            ),
            _ => format!(
                "Launch ID (x, y, z) = ({}, {}, {})",
                info[0], info[1], info[2]
            ),
        };
        format!("Stage = {}. {}", self.name(), detail)
    }
}

/// Like [`ShaderStage::describe`], tolerating ids that no stage claims.
pub fn describe_stage(stage_id: u32, info: [u32; 3]) -> String {
    match ShaderStage::from_id(stage_id) {
        Some(stage) => stage.describe(info),
        None => format!("Stage = unknown ({stage_id})"),
    }
}
