use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::core::{ApiResource, GroupVersionKind};
use refmap_core::Document;
use refmap_refs::{Capabilities, Entity, EntityKind, MappingTree};
use refmap_translate::{from_api_document, to_api_document, Request, Translated, Translator};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

mod input;

#[derive(Parser, Debug)]
#[command(name = "refmapctl", version, about = "Translate Kubernetes resources to and from API payloads")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a resource against the bound CRD schema
    Validate {
        #[command(flatten)]
        bind: BindArgs,
        /// Resource file (YAML or JSON)
        doc: PathBuf,
    },
    /// List the references declared by the CRD's api-mappings annotation
    Mappings {
        #[command(flatten)]
        bind: BindArgs,
    },
    /// Translate a resource into its API payload
    ToApi {
        #[command(flatten)]
        bind: BindArgs,
        /// Resource file (YAML or JSON)
        cr: PathBuf,
        /// Objects the resource references (multi-document YAML or a List)
        #[arg(long = "deps")]
        deps: Option<PathBuf>,
    },
    /// Build a resource and its referenced objects from an API payload
    FromApi {
        #[command(flatten)]
        bind: BindArgs,
        /// API payload file (YAML or JSON)
        api: PathBuf,
        /// Resource to fill (default: an empty object of the bound kind)
        #[arg(long = "template")]
        template: Option<PathBuf>,
        /// metadata.name of the resource; overrides the template
        #[arg(long = "name")]
        name: Option<String>,
        /// metadata.namespace of the resource; overrides the template
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Objects references may resolve to (multi-document YAML or a List)
        #[arg(long = "deps")]
        deps: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct BindArgs {
    /// CRD file (YAML or JSON)
    #[arg(long = "crd")]
    crd: PathBuf,
    /// CRD version to bind (default: the first one listed)
    #[arg(long = "crd-version", default_value = "")]
    crd_version: String,
    /// API major version, e.g. "v20250312"
    #[arg(long = "major")]
    major: String,
    /// Extra referenced kind, e.g. "atlas.generated.mongodb.com/v1/Group=groups"
    #[arg(long = "kind")]
    kinds: Vec<String>,
    /// Reference field allowed to stay inline when no selector fits
    #[arg(long = "optional")]
    optional: Vec<String>,
}

fn init_tracing() {
    let env = std::env::var("REFMAP_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn parse_gvk(key: &str) -> Option<GroupVersionKind> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Some(GroupVersionKind::gvk(group, version, kind)),
        _ => None,
    }
}

/// `group/version/Kind=plural` as a registered entity kind keyed by its GVR.
fn parse_kind(spec: &str) -> Result<(String, EntityKind)> {
    let (gvk, plural) = spec.split_once('=').ok_or_else(|| anyhow!("--kind {:?}: expected GVK=plural", spec))?;
    let gvk = parse_gvk(gvk).ok_or_else(|| anyhow!("--kind {:?}: expected [group/]version/Kind", spec))?;
    let ar = ApiResource::from_gvk_with_plural(&gvk, plural);
    let gvr = format!("{}/{}", ar.api_version, ar.plural);
    Ok((gvr, EntityKind::Custom(ar)))
}

impl BindArgs {
    fn capabilities(&self) -> Result<Capabilities> {
        let mut caps = Capabilities::default();
        for k in &self.kinds {
            let (gvr, kind) = parse_kind(k)?;
            caps = caps.with_kind(&gvr, kind);
        }
        for r in &self.optional {
            caps = caps.with_optional_expansion(r);
        }
        Ok(caps)
    }

    fn translator(&self) -> Result<Translator> {
        let crd = input::read_crd(&self.crd)?;
        let caps = Arc::new(self.capabilities()?);
        let t = Translator::bind(&crd, &self.crd_version, &self.major, caps)
            .with_context(|| format!("binding {} to {}", self.crd.display(), self.major))?;
        info!(crd = %self.crd.display(), major = %self.major, mapped = t.mappings().is_some(), "translator bound");
        Ok(t)
    }
}

fn read_deps(path: Option<&Path>) -> Result<Vec<Entity>> {
    match path {
        Some(p) => input::read_entities(p),
        None => Ok(Vec::new()),
    }
}

fn print_doc(output: Output, doc: &impl Serialize) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(doc)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(doc)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct MappingRow {
    path: String,
    kind: String,
    #[serde(rename = "nameSelector")]
    name_selector: String,
    property: String,
    optional: bool,
}

fn mapping_rows(tree: &MappingTree) -> Vec<MappingRow> {
    tree.reference_sites()
        .into_iter()
        .map(|site| MappingRow {
            path: site.path.to_string(),
            kind: site.descriptor.kube.type_.to_string(),
            name_selector: site.descriptor.kube.name_selector.clone(),
            property: site.descriptor.openapi.property.clone(),
            optional: site.descriptor.kube.optional,
        })
        .collect()
}

/// The resource `from-api` fills: the template (or a bare object of the bound kind)
/// with the requested name and namespace.
fn from_api_template(t: &Translator, template: Option<&Path>, name: Option<String>, namespace: Option<String>) -> Result<Document> {
    let mut doc = match template {
        Some(p) => input::read_document(p)?,
        None => {
            let gvk = t.binding().gvk();
            let api_version = if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) };
            json!({"apiVersion": api_version, "kind": gvk.kind})
        }
    };
    let Value::Object(root) = &mut doc else { bail!("template must be an object") };
    let meta = root.entry("metadata").or_insert_with(|| json!({}));
    let Value::Object(meta) = meta else { bail!("template metadata must be an object") };
    if let Some(n) = name {
        meta.insert("name".into(), Value::String(n));
    }
    if let Some(ns) = namespace {
        meta.insert("namespace".into(), Value::String(ns));
    }
    Ok(doc)
}

fn print_translated(output: Output, out: &Translated) -> Result<()> {
    let added = out.added.iter().map(Entity::to_document).collect::<Result<Vec<_>, _>>()?;
    match output {
        Output::Human => {
            print!("{}", serde_yaml::to_string(&out.primary)?);
            for doc in &added {
                println!("---");
                print!("{}", serde_yaml::to_string(doc)?);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&json!({"primary": out.primary, "added": added}))?),
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { bind, doc } => {
            let t = bind.translator()?;
            let doc = input::read_document(&doc)?;
            let issues = match t.validate(&doc) {
                Ok(()) => Vec::new(),
                Err(e) => e.issues,
            };
            match cli.output {
                Output::Human if issues.is_empty() => println!("valid"),
                Output::Human => {
                    for i in &issues {
                        match &i.hint {
                            Some(h) => println!("{} ({})", i, h),
                            None => println!("{}", i),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&json!({"valid": issues.is_empty(), "issues": issues}))?),
            }
            if !issues.is_empty() {
                bail!("{} validation issue(s)", issues.len());
            }
        }
        Commands::Mappings { bind } => {
            let t = bind.translator()?;
            let rows = t.mappings().map(mapping_rows).unwrap_or_default();
            match cli.output {
                Output::Human => {
                    if rows.is_empty() {
                        println!("no api-mappings on this CRD");
                    }
                    for r in &rows {
                        let opt = if r.optional { " (optional)" } else { "" };
                        println!("{:<48} {:<40} {} -> {}{}", r.path, r.kind, r.name_selector, r.property, opt);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::ToApi { bind, cr, deps } => {
            let t = bind.translator()?;
            let resource = input::read_document(&cr)?;
            let deps = read_deps(deps.as_deref())?;
            info!(deps = deps.len(), "to-api invoked");
            let req = Request::new(&t, deps);
            let payload = to_api_document(&req, &resource).with_context(|| format!("translating {}", cr.display()))?;
            print_doc(cli.output, &payload)?;
        }
        Commands::FromApi { bind, api, template, name, namespace, deps } => {
            let t = bind.translator()?;
            let payload = input::read_document(&api)?;
            let template = from_api_template(&t, template.as_deref(), name, namespace)?;
            let deps = read_deps(deps.as_deref())?;
            info!(deps = deps.len(), "from-api invoked");
            let req = Request::new(&t, deps);
            let out = from_api_document(&req, template, &payload).with_context(|| format!("translating {}", api.display()))?;
            print_translated(cli.output, &out)?;
        }
    }

    Ok(())
}
