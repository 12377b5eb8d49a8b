/// Tantivy keyword index over pre-segmented terms
use crate::error::{RagError, Result};
use crate::retrieval::ContentType;
use crate::services::IndexHit;
use crate::text::auto_fuzziness;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, TextAnalyzer, WhitespaceTokenizer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

/// Analyzer for the `terms` field; input is already segmented
const TERMS_ANALYZER: &str = "ragfuse_terms";

/// Weight of fuzzy matches relative to exact term matches
const FUZZY_BOOST: f32 = 0.5;

const WRITER_BUDGET_BYTES: usize = 50_000_000;

struct Fields {
    chunk_id: Field,
    doc_id: Field,
    content_type: Field,
    text: Field,
    terms: Field,
}

/// BM25 index with optional edit-distance expansion
pub struct KeywordIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    fields: Fields,
    fuzzy: bool,
}

impl KeywordIndex {
    /// Open the index in `dir`, creating it when absent
    pub fn open(dir: &Path, fuzzy: bool) -> Result<Self> {
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir).map_err(index_error("open keyword index"))?
        } else {
            std::fs::create_dir_all(dir).map_err(|e| RagError::Io {
                source: e,
                context: format!("Failed to create keyword index directory: {:?}", dir),
            })?;
            Index::create_in_dir(dir, build_schema())
                .map_err(index_error("create keyword index"))?
        };

        index.tokenizers().register(
            TERMS_ANALYZER,
            TextAnalyzer::builder(WhitespaceTokenizer::default())
                .filter(LowerCaser)
                .build(),
        );

        let schema = index.schema();
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| RagError::Index(format!("Missing '{}' field in schema", name)))
        };
        let fields = Fields {
            chunk_id: field("chunk_id")?,
            doc_id: field("doc_id")?,
            content_type: field("content_type")?,
            text: field("text")?,
            terms: field("terms")?,
        };

        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(index_error("create reader"))?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(None),
            fields,
            fuzzy,
        })
    }

    /// Replace any document with the same chunk id. Visible after [`commit`](Self::commit).
    pub fn upsert(
        &self,
        chunk_id: &str,
        doc_id: &str,
        content_type: ContentType,
        text: &str,
        terms: &[String],
    ) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let writer: IndexWriter = self
                .index
                .writer(WRITER_BUDGET_BYTES)
                .map_err(index_error("open writer"))?;
            *guard = Some(writer);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(RagError::Index("Keyword writer unavailable".to_string()));
        };

        writer.delete_term(Term::from_field_text(self.fields.chunk_id, chunk_id));
        writer
            .add_document(doc!(
                self.fields.chunk_id => chunk_id,
                self.fields.doc_id => doc_id,
                self.fields.content_type => content_type.as_str(),
                self.fields.text => text,
                self.fields.terms => terms.join(" "),
            ))
            .map_err(index_error("add document"))?;

        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = guard.as_mut() {
            writer.commit().map_err(index_error("commit"))?;
            self.reader.reload().map_err(index_error("reload reader"))?;
        }
        Ok(())
    }

    /// BM25 over exact terms, plus down-weighted fuzzy matches when enabled
    pub fn search(&self, terms: &[String], limit: usize) -> Result<Vec<IndexHit>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for raw in terms {
            let term = Term::from_field_text(self.fields.terms, &raw.to_lowercase());
            clauses.push((
                Occur::Should,
                Box::new(TermQuery::new(term.clone(), IndexRecordOption::WithFreqs)),
            ));

            let distance = auto_fuzziness(raw);
            if self.fuzzy && distance > 0 {
                let fuzzy = FuzzyTermQuery::new(term, distance, true);
                clauses.push((
                    Occur::Should,
                    Box::new(BoostQuery::new(Box::new(fuzzy), FUZZY_BOOST)),
                ));
            }
        }
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(index_error("search"))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(index_error("load document"))?;
            let get = |field: Field| {
                doc.get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };

            hits.push(IndexHit {
                doc_id: get(self.fields.doc_id),
                chunk_id: get(self.fields.chunk_id),
                content_type: get(self.fields.content_type).parse().unwrap_or_default(),
                text: get(self.fields.text),
                score,
            });
        }

        Ok(hits)
    }

    pub fn len(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field("chunk_id", STRING | STORED);
    builder.add_text_field("doc_id", STRING | STORED);
    builder.add_text_field("content_type", STRING | STORED);
    builder.add_text_field("text", STORED);

    let terms = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TERMS_ANALYZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    builder.add_text_field("terms", terms);
    builder.build()
}

fn index_error<E: std::fmt::Display>(action: &'static str) -> impl Fn(E) -> RagError {
    move |e| RagError::Index(format!("Failed to {}: {}", action, e))
}
