use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use crate::config::defs::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationFormat {
    Gtf,
    Gff,
}

/// Everything the stages need to know about one species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesReference {
    pub genome_label: String,
    /// HISAT2 index prefix; `<prefix>.1.ht2` must exist.
    pub hisat2_index: PathBuf,
    pub annotation: PathBuf,
    pub annotation_format: AnnotationFormat,
    #[serde(default = "default_feature_type")]
    pub feature_type: String,
    #[serde(default = "default_attribute")]
    pub id_attribute: String,
    #[serde(default)]
    pub go_links: Option<PathBuf>,
    #[serde(default)]
    pub kegg_links: Option<PathBuf>,
}

fn default_feature_type() -> String {
    "exon".to_string()
}

fn default_attribute() -> String {
    "gene_id".to_string()
}

lazy_static! {
    static ref DEFAULT_SPECIES: BTreeMap<String, SpeciesReference> = {
        let mut m = BTreeMap::new();
        m.insert("human".to_string(), SpeciesReference {
            genome_label: "Homo sapiens (GRCh38)".to_string(),
            hisat2_index: PathBuf::from("index/human/genome"),
            annotation: PathBuf::from("gtf/Homo_sapiens.GRCh38.114.gtf"),
            annotation_format: AnnotationFormat::Gtf,
            feature_type: default_feature_type(),
            id_attribute: default_attribute(),
            go_links: Some(PathBuf::from("links/homo_sapiens_go_links.csv")),
            kegg_links: Some(PathBuf::from("links/homo_sapiens_kegg_links.csv")),
        });
        m.insert("mouse".to_string(), SpeciesReference {
            genome_label: "Mus musculus (GRCm39)".to_string(),
            hisat2_index: PathBuf::from("index/mouse/genome"),
            annotation: PathBuf::from("gtf/Mus_musculus.GRCm39.114.gtf"),
            annotation_format: AnnotationFormat::Gtf,
            feature_type: default_feature_type(),
            id_attribute: default_attribute(),
            go_links: Some(PathBuf::from("links/mus_musculus_go_links.csv")),
            kegg_links: Some(PathBuf::from("links/mus_musculus_kegg_links.csv")),
        });
        m.insert("yeast".to_string(), SpeciesReference {
            genome_label: "Saccharomyces cerevisiae (R64-1-1)".to_string(),
            hisat2_index: PathBuf::from("index/yeast/yeast_index"),
            annotation: PathBuf::from("gtf/Saccharomyces_cerevisiae.R64-1-1.114.gtf"),
            annotation_format: AnnotationFormat::Gtf,
            feature_type: default_feature_type(),
            id_attribute: default_attribute(),
            go_links: Some(PathBuf::from("links/saccharomyces_cerevisiae_go_links.csv")),
            kegg_links: Some(PathBuf::from("links/saccharomyces_cerevisiae_kegg_links.csv")),
        });
        for (name, label, annotation, prefix) in [
            ("arabidopsis", "Arabidopsis thaliana (TAIR10)", "Arabidopsis_thaliana.TAIR10.61.gff3", "arabidopsis_thaliana"),
            ("worm", "Caenorhabditis elegans (WBcel235)", "Caenorhabditis_elegans.WBcel235.114.gff3", "caenorhabditis_elegans"),
            ("zebrafish", "Danio rerio (GRCz11)", "Danio_rerio.GRCz11.114.gff3", "danio_rerio"),
            ("fly", "Drosophila melanogaster (BDGP6.54)", "Drosophila_melanogaster.BDGP6.54.61.gff3", "drosophila_melanogaster"),
            ("rice", "Oryza sativa (IRGSP-1.0)", "Oryza_sativa.IRGSP-1.0.61.gff3", "oryza_sativa"),
            ("maize", "Zea mays (Zm-B73-REFERENCE-NAM-5.0)", "Zea_mays.Zm-B73-REFERENCE-NAM-5.0.61.gff3", "zea_mays"),
        ] {
            m.insert(name.to_string(), gff3_species(name, label, annotation, prefix));
        }
        m
    };
}

/// Ensembl GFF3 layout: counted per `gene` row, links named after the binomial.
fn gff3_species(name: &str, label: &str, annotation: &str, links_prefix: &str) -> SpeciesReference {
    SpeciesReference {
        genome_label: label.to_string(),
        hisat2_index: PathBuf::from(format!("index/{}/genome", name)),
        annotation: PathBuf::from("gff3").join(annotation),
        annotation_format: AnnotationFormat::Gff,
        feature_type: "gene".to_string(),
        id_attribute: default_attribute(),
        go_links: Some(PathBuf::from(format!("links/{}_go_links.csv", links_prefix))),
        kegg_links: Some(PathBuf::from(format!("links/{}_kegg_links.csv", links_prefix))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    species: BTreeMap<String, SpeciesReference>,
}

/// Read-only species table, loaded once at startup and shared by every stage.
#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    root: PathBuf,
    species: BTreeMap<String, SpeciesReference>,
}

impl ReferenceCatalog {
    pub fn builtin(root: &Path) -> Self {
        ReferenceCatalog {
            root: root.to_path_buf(),
            species: DEFAULT_SPECIES.clone(),
        }
    }

    pub fn from_toml(root: &Path, raw: &str) -> Result<Self, PipelineError> {
        let parsed: CatalogFile =
            toml::from_str(raw).map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        if parsed.species.is_empty() {
            return Err(PipelineError::InvalidConfig("reference catalog defines no species".to_string()));
        }
        let species = parsed
            .species
            .into_iter()
            .map(|(name, reference)| (name.to_lowercase(), reference))
            .collect();
        Ok(ReferenceCatalog { root: root.to_path_buf(), species })
    }

    pub fn load(root: &Path, file: Option<&Path>) -> Result<Self, PipelineError> {
        match file {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| PipelineError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
                Self::from_toml(root, &raw)
            }
            None => Ok(Self::builtin(root)),
        }
    }

    pub fn get(&self, species: &str) -> Result<&SpeciesReference, PipelineError> {
        self.species
            .get(&species.to_lowercase())
            .ok_or_else(|| PipelineError::InvalidConfig(format!("No reference defined for species: {}", species)))
    }

    pub fn species_names(&self) -> Vec<&str> {
        self.species.keys().map(|k| k.as_str()).collect()
    }

    /// Resolves a catalog path against the references root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn hisat2_index(&self, species: &str) -> Result<PathBuf, PipelineError> {
        Ok(self.resolve(&self.get(species)?.hisat2_index))
    }

    pub fn annotation(&self, species: &str) -> Result<PathBuf, PipelineError> {
        Ok(self.resolve(&self.get(species)?.annotation))
    }

    pub fn genome_label(&self, species: &str) -> String {
        self.get(species)
            .map(|r| r.genome_label.clone())
            .unwrap_or_else(|_| "Unknown".to_string())
    }
}
