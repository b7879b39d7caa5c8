use std::env;
use std::fs;
use std::path::Path;

use glam::{Mat4, Quat, Vec2, Vec3};
use serde::Deserialize;

use rift_core::cast::{cast_through_portals, CastLimits, CastPath, SceneHit, SceneRaycaster};
use rift_core::layers::LayerMask;
use rift_core::portal::{Portal, PortalId, PortalSet};

#[derive(Debug, Deserialize)]
struct SceneFile {
    #[serde(default)]
    portals: Vec<PortalEntry>,
    path: PathEntry,
}

#[derive(Debug, Deserialize)]
struct PortalEntry {
    name: String,
    position: Vec3,
    #[serde(default)]
    yaw_degrees: f32,
    half_extents: Vec2,
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PathEntry {
    Straight {
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    },
    Parabolic {
        origin: Vec3,
        velocity: Vec3,
        gravity: Vec3,
        duration: f32,
    },
    Bezier {
        points: [Vec3; 4],
    },
}

impl From<&PathEntry> for CastPath {
    fn from(entry: &PathEntry) -> Self {
        match *entry {
            PathEntry::Straight {
                origin,
                direction,
                max_distance,
            } => CastPath::Straight {
                origin,
                direction,
                max_distance,
            },
            PathEntry::Parabolic {
                origin,
                velocity,
                gravity,
                duration,
            } => CastPath::Parabolic {
                origin,
                velocity,
                gravity,
                duration,
            },
            PathEntry::Bezier { points } => CastPath::Bezier { points },
        }
    }
}

/// Infinite floor at y = 0.
struct GroundPlane;

impl SceneRaycaster for GroundPlane {
    fn raycast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        _mask: LayerMask,
    ) -> Option<SceneHit> {
        if direction.y.abs() <= f32::EPSILON {
            return None;
        }
        let t = -origin.y / direction.y;
        (t >= 0.0 && t <= max_distance).then(|| SceneHit {
            point: origin + direction * t,
            normal: Vec3::Y,
            distance: t,
        })
    }
}

fn main() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();

    let mut scene_path: Option<String> = None;
    let mut limits = CastLimits::default();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--samples" => {
                let Some(value) = args.next() else {
                    eprintln!("--samples expects a numeric argument");
                    std::process::exit(2);
                };
                match value.parse::<u32>() {
                    Ok(parsed) => limits.samples = parsed.max(1),
                    Err(err) => {
                        eprintln!("invalid sample count '{value}': {err}");
                        std::process::exit(2);
                    }
                }
            }
            "--crossings" => {
                let Some(value) = args.next() else {
                    eprintln!("--crossings expects a numeric argument");
                    std::process::exit(2);
                };
                match value.parse::<u32>() {
                    Ok(parsed) => limits.max_crossings = parsed,
                    Err(err) => {
                        eprintln!("invalid crossing limit '{value}': {err}");
                        std::process::exit(2);
                    }
                }
            }
            "--help" | "-h" => {
                println!("Usage: cast_probe <scene.toml> [--samples <u32>] [--crossings <u32>]");
                return;
            }
            other if scene_path.is_none() && !other.starts_with('-') => {
                scene_path = Some(other.to_string());
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }

    let Some(scene_path) = scene_path else {
        eprintln!("Usage: cast_probe <scene.toml> [--samples <u32>] [--crossings <u32>]");
        std::process::exit(2);
    };

    if let Err(err) = run(Path::new(&scene_path), &limits) {
        eprintln!("cast_probe error: {err}");
        std::process::exit(1);
    }
}

fn run(scene_path: &Path, limits: &CastLimits) -> Result<(), String> {
    let scene_src = fs::read_to_string(scene_path)
        .map_err(|err| format!("failed to read {}: {err}", scene_path.display()))?;
    let scene: SceneFile = toml::from_str(&scene_src)
        .map_err(|err| format!("failed to parse {}: {err}", scene_path.display()))?;

    let (set, names) = build_portal_set(&scene)?;
    let path = CastPath::from(&scene.path);

    let cast = cast_through_portals(&set, &path, limits, &GroundPlane);

    println!("Scene: {}", scene_path.display());
    println!("Portals: {}", set.len());
    println!("Crossings: {}", cast.crossings.len());
    for (index, crossing) in cast.crossings.iter().enumerate() {
        let name = names
            .iter()
            .find(|(id, _)| *id == crossing.portal)
            .map(|(_, name)| name.as_str())
            .unwrap_or("?");
        println!(
            "  {index}: {name} @ ({:.3}, {:.3}, {:.3})",
            crossing.point.x, crossing.point.y, crossing.point.z
        );
    }
    if cast.truncated {
        println!("Truncated at the crossing limit ({})", limits.max_crossings);
    }

    match cast.hit {
        Some(hit) => println!(
            "Hit: ({:.3}, {:.3}, {:.3}) at distance {:.3}",
            hit.point.x, hit.point.y, hit.point.z, hit.distance
        ),
        None => println!("Hit: none"),
    }
    if let Some(presented) = cast.presented_hit {
        println!(
            "Presented hit: ({:.3}, {:.3}, {:.3})",
            presented.point.x, presented.point.y, presented.point.z
        );
    }

    Ok(())
}

fn build_portal_set(scene: &SceneFile) -> Result<(PortalSet, Vec<(PortalId, String)>), String> {
    let mut set = PortalSet::new();
    let mut names: Vec<(PortalId, String)> = Vec::new();

    for entry in &scene.portals {
        if names.iter().any(|(_, name)| *name == entry.name) {
            return Err(format!("duplicate portal name '{}'", entry.name));
        }
        let pose = Mat4::from_rotation_translation(
            Quat::from_rotation_y(entry.yaw_degrees.to_radians()),
            entry.position,
        );
        let id = set.insert(Portal::new(pose, entry.half_extents));
        names.push((id, entry.name.clone()));
    }

    for entry in &scene.portals {
        let Some(target) = &entry.link else {
            continue;
        };
        let from = lookup(&names, &entry.name)?;
        let to = lookup(&names, target)?;
        if set.partner_of(from) == Some(to) {
            continue;
        }
        if !set.link(from, to) {
            return Err(format!("cannot link '{}' to '{target}'", entry.name));
        }
    }

    Ok((set, names))
}

fn lookup(names: &[(PortalId, String)], name: &str) -> Result<PortalId, String> {
    names
        .iter()
        .find(|(_, n)| n == name)
        .map(|(id, _)| *id)
        .ok_or_else(|| format!("unknown portal name '{name}'"))
}
